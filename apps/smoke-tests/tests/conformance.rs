use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgb, Rgba, RgbaImage};
use padpress_batch::{run_process_batch, run_resize_batch, InputFile, ProcessSettings, ResizeSettings};
use padpress_core::{
    CanvasSpec, CoreError, EditParams, EncodingParameters, OutputFormat, OutputSize, PadColor, RemoteEditor,
    RemoteResponse,
};
use padpress_image::{decode, encode_within_cap, fit_geometry, fit_to_canvas, ImageSize};

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    }))
}

fn zip_entry_names(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_string());
    }
    Ok(names)
}

#[test]
fn landscape_photo_on_portrait_canvas_is_centered_with_even_padding() -> Result<()> {
    let white = PadColor::new(255, 255, 255);
    let canvas = CanvasSpec::new(1200, 1500, white)?;
    let geometry = fit_geometry(
        ImageSize {
            width: 4000,
            height: 3000,
        },
        &canvas,
    )?;
    assert!((geometry.scale - 0.3).abs() < 1e-9);
    assert_eq!(geometry.size, ImageSize { width: 1200, height: 900 });
    assert_eq!(geometry.offset_y, 300);
    assert_eq!(1500 - geometry.size.height - geometry.offset_y, geometry.offset_y);

    // Same proportions at a tenth of the size keeps the pixel check quick.
    let small_canvas = CanvasSpec::new(120, 150, white)?;
    let source = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(400, 300, Rgb([20, 40, 200])));
    let fitted = fit_to_canvas(&source, &small_canvas, OutputFormat::Png)?;
    assert_eq!(fitted.dimensions(), (120, 150));
    let rgba = fitted.to_rgba8();
    assert_eq!(rgba.get_pixel(60, 29).0, [255, 255, 255, 255]);
    assert_eq!(rgba.get_pixel(60, 120).0, [255, 255, 255, 255]);
    let center = rgba.get_pixel(60, 75).0;
    for (got, want) in center.iter().zip([20u8, 40, 200, 255]) {
        assert!((*got as i16 - want as i16).abs() <= 1, "centre {:?}", center);
    }
    Ok(())
}

#[test]
fn transparent_square_becomes_opaque_gray_jpeg() -> Result<()> {
    let transparent = DynamicImage::ImageRgba8(RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 0])));
    let settings = ResizeSettings {
        canvas: CanvasSpec::new(500, 500, PadColor::new(239, 239, 239))?,
        encoding: EncodingParameters::for_format(OutputFormat::Jpeg),
    };
    let report = run_resize_batch(&[InputFile::new("ghost.png", encode_png(&transparent)?)], &settings, None)?;
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].name, "resized_ghost.jpeg");

    let mut archive = zip::ZipArchive::new(Cursor::new(report.archive.as_slice()))?;
    let mut entry = archive.by_index(0)?;
    let mut bytes = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut bytes)?;
    let output = decode(&bytes)?;
    assert_eq!(output.dimensions(), (500, 500));
    assert!(!output.color().has_alpha());
    let corner = output.to_rgb8().get_pixel(0, 0).0;
    assert!(corner.iter().all(|c| (*c as i16 - 239).abs() <= 3), "corner {:?}", corner);
    Ok(())
}

#[test]
fn canvas_output_is_exact_for_many_aspect_ratios() -> Result<()> {
    let canvas = CanvasSpec::new(300, 200, PadColor::default())?;
    for (w, h) in [(10, 10), (900, 100), (100, 900), (301, 199), (3, 1000), (640, 480)] {
        let fitted = fit_to_canvas(&gradient(w, h), &canvas, OutputFormat::Webp)?;
        assert_eq!(fitted.dimensions(), (300, 200), "source {}x{}", w, h);

        let geometry = fit_geometry(ImageSize { width: w, height: h }, &canvas)?;
        assert!(geometry.offset_x + geometry.size.width <= 300);
        assert!(geometry.offset_y + geometry.size.height <= 200);
        assert!(geometry.size.width == 300 || geometry.size.height == 200);
    }
    Ok(())
}

#[test]
fn encoder_meets_cap_or_returns_floor_quality() -> Result<()> {
    let image = gradient(1600, 1600);
    for format in [OutputFormat::Jpeg, OutputFormat::Webp] {
        let params = EncodingParameters::for_format(format);
        let outcome = encode_within_cap(&image, &params)?;
        assert!(outcome.attempts <= 17);
        if outcome.within_cap {
            assert!(outcome.bytes.len() <= 200 * 1024);
        } else {
            assert_eq!(outcome.quality, 5);
        }
    }
    Ok(())
}

struct FlakyEditor {
    calls: AtomicUsize,
}

impl RemoteEditor for FlakyEditor {
    fn edit(&self, image: &[u8], _file_name: &str, _params: &EditParams) -> Result<RemoteResponse, CoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 2 {
            return Ok(RemoteResponse {
                status: 500,
                body: b"upstream exploded".to_vec(),
            });
        }
        Ok(RemoteResponse {
            status: 200,
            body: image.to_vec(),
        })
    }
}

#[test]
fn one_remote_failure_out_of_three_leaves_two_entries() -> Result<()> {
    let editor = FlakyEditor {
        calls: AtomicUsize::new(0),
    };
    let inputs = vec![
        InputFile::new("a.png", encode_png(&gradient(40, 40))?),
        InputFile::new("b.jpg", encode_png(&gradient(40, 40))?),
        InputFile::new("c.webp", encode_png(&gradient(40, 40))?),
    ];
    let settings = ProcessSettings::new(
        EditParams::new(PadColor::default(), OutputFormat::Png, OutputSize::default()),
        200,
    );
    let report = run_process_batch(&editor, &inputs, &settings, None)?;

    assert_eq!(zip_entry_names(&report.archive)?, vec!["a_processed.png", "b_processed.png"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].input, "c.webp");
    assert!(report.failures[0].error.message.contains("500"));
    assert!(report.failures[0].error.message.contains("upstream exploded"));
    assert!(report.download_offered());
    Ok(())
}
