use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use mozjpeg::{ColorSpace, Compress};
use padpress_core::{CanvasSpec, CoreError, EncodingParameters, OutputFormat};
use tracing::{debug, warn};

/// NeuQuant sampling factor: 1 inspects every pixel, 30 is the fastest.
const PALETTE_SAMPLE_FACTOR: i32 = 10;
const PALETTE_COLORS: usize = 256;
/// Largest width or height each encoder accepts.
const JPEG_MAX_DIMENSION: u32 = 65_500;
const WEBP_MAX_DIMENSION: u32 = 16_383;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CoreError> {
    let image = image::load_from_memory(bytes).map_err(|e| CoreError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(CoreError::Decode("image has zero width or height".to_string()));
    }
    Ok(image)
}

#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub bytes: Vec<u8>,
    /// Quality of the returned encode. For PNG this is the starting quality,
    /// the value has no effect on PNG output.
    pub quality: u8,
    pub attempts: u32,
    pub within_cap: bool,
}

/// Encodes `image` at decreasing quality until the output fits under the
/// size cap or the quality floor is reached.
///
/// Hitting the floor is not an error: the floor-quality bytes are returned
/// with `within_cap == false`.
///
/// PNG has no quality setting. The image is reduced to an adaptive palette
/// and encoded once, since lowering the quality could never change the bytes.
pub fn encode_within_cap(image: &DynamicImage, params: &EncodingParameters) -> Result<EncodeOutcome, CoreError> {
    params.validate()?;
    let cap = params.size_cap_bytes();

    if params.format == OutputFormat::Png {
        let bytes = encode_png_palette(image)?;
        let within_cap = bytes.len() <= cap;
        debug!(size = bytes.len(), cap, "palette png encoded");
        if !within_cap {
            warn!(size = bytes.len(), cap, "png exceeds size cap after palette reduction");
        }
        return Ok(EncodeOutcome {
            bytes,
            quality: params.start_quality,
            attempts: 1,
            within_cap,
        });
    }

    let step = params.quality_step.unsigned_abs();
    let mut quality = params.start_quality;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let bytes = encode_at_quality(image, params.format, quality)?;
        debug!(quality, size = bytes.len(), cap, attempts, "encode attempt");
        if bytes.len() <= cap || quality <= params.quality_floor {
            let within_cap = bytes.len() <= cap;
            if !within_cap {
                warn!(
                    quality,
                    size = bytes.len(),
                    cap,
                    "quality floor reached before size cap was met"
                );
            }
            return Ok(EncodeOutcome {
                bytes,
                quality,
                attempts,
                within_cap,
            });
        }
        quality = quality.saturating_sub(step).max(params.quality_floor);
    }
}

/// Single encode pass. `quality` is ignored for PNG.
pub fn encode_at_quality(image: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, CoreError> {
    match format {
        OutputFormat::Jpeg | OutputFormat::Jpg => encode_jpeg(image, quality, true),
        OutputFormat::Webp => encode_webp(image, quality),
        OutputFormat::Png => encode_png_palette(image),
    }
}

fn ensure_encodable(image: &DynamicImage, format: &str, max_dimension: u32) -> Result<(), CoreError> {
    let (width, height) = image.dimensions();
    if width > max_dimension || height > max_dimension {
        return Err(CoreError::Encode(format!(
            "{} supports at most {}px per side (got {}x{})",
            format, max_dimension, width, height
        )));
    }
    Ok(())
}

/// JPEG through mozjpeg. `optimize` builds per-image Huffman tables instead
/// of the standard ones; the size-capped search always enables it.
fn encode_jpeg(image: &DynamicImage, quality: u8, optimize: bool) -> Result<Vec<u8>, CoreError> {
    ensure_encodable(image, "jpeg", JPEG_MAX_DIMENSION)?;
    // JPEG cannot carry alpha; drop it before encoding.
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut comp = Compress::new(ColorSpace::JCS_RGB);
    comp.set_size(width as usize, height as usize);
    comp.set_color_space(ColorSpace::JCS_YCbCr);
    comp.set_quality(quality.clamp(1, 100) as f32);
    comp.set_optimize_coding(optimize);

    let mut out = Vec::with_capacity((width as usize * height as usize / 10).max(4096));
    let mut writer = comp
        .start_compress(&mut out)
        .map_err(|e| CoreError::Encode(format!("jpeg start: {}", e)))?;
    for row in rgb.as_raw().chunks(width as usize * 3) {
        writer
            .write_scanlines(row)
            .map_err(|e| CoreError::Encode(format!("jpeg scanlines: {}", e)))?;
    }
    writer
        .finish()
        .map_err(|e| CoreError::Encode(format!("jpeg finish: {}", e)))?;
    Ok(out)
}

fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CoreError> {
    ensure_encodable(image, "webp", WEBP_MAX_DIMENSION)?;
    let (width, height) = image.dimensions();
    let encoded = if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        webp::Encoder::from_rgba(&rgba, width, height).encode_simple(false, quality as f32)
    } else {
        let rgb = image.to_rgb8();
        webp::Encoder::from_rgb(&rgb, width, height).encode_simple(false, quality as f32)
    };
    encoded
        .map(|memory| memory.to_vec())
        .map_err(|e| CoreError::Encode(format!("webp: {:?}", e)))
}

fn encode_png_palette(image: &DynamicImage) -> Result<Vec<u8>, CoreError> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let quant = color_quant::NeuQuant::new(PALETTE_SAMPLE_FACTOR, PALETTE_COLORS, rgba.as_raw());
    let color_map = quant.color_map_rgba();

    let mut palette = Vec::with_capacity(color_map.len() / 4 * 3);
    let mut trns = Vec::with_capacity(color_map.len() / 4);
    for entry in color_map.chunks_exact(4) {
        palette.extend_from_slice(&entry[..3]);
        trns.push(entry[3]);
    }
    let indices: Vec<u8> = rgba.pixels().map(|px| quant.index_of(&px.0) as u8).collect();

    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, width, height);
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_palette(palette);
    if trns.iter().any(|alpha| *alpha < 255) {
        encoder.set_trns(trns);
    }
    encoder.set_compression(png::Compression::Best);
    encoder.set_adaptive_filter(png::AdaptiveFilterType::Adaptive);
    let mut writer = encoder
        .write_header()
        .map_err(|e| CoreError::Encode(format!("png header: {}", e)))?;
    writer
        .write_image_data(&indices)
        .map_err(|e| CoreError::Encode(format!("png data: {}", e)))?;
    writer
        .finish()
        .map_err(|e| CoreError::Encode(format!("png finish: {}", e)))?;
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitGeometry {
    pub scale: f64,
    pub size: ImageSize,
    pub offset_x: u32,
    pub offset_y: u32,
}

/// Largest uniform scale that fits the source inside the canvas, and where the
/// scaled source sits when centered.
pub fn fit_geometry(source: ImageSize, canvas: &CanvasSpec) -> Result<FitGeometry, CoreError> {
    if source.width == 0 || source.height == 0 {
        return Err(CoreError::Decode(format!(
            "cannot fit a {}x{} image",
            source.width, source.height
        )));
    }
    let scale_x = canvas.width() as f64 / source.width as f64;
    let scale_y = canvas.height() as f64 / source.height as f64;
    let scale = scale_x.min(scale_y);
    let width = ((source.width as f64 * scale).round() as u32).clamp(1, canvas.width());
    let height = ((source.height as f64 * scale).round() as u32).clamp(1, canvas.height());
    Ok(FitGeometry {
        scale,
        size: ImageSize { width, height },
        offset_x: (canvas.width() - width) / 2,
        offset_y: (canvas.height() - height) / 2,
    })
}

/// Scales `image` to fit the canvas without cropping and centers it on the
/// pad colour. The result is flattened to RGB when `format` has no alpha.
pub fn fit_to_canvas(image: &DynamicImage, canvas: &CanvasSpec, format: OutputFormat) -> Result<DynamicImage, CoreError> {
    let (src_w, src_h) = image.dimensions();
    let geometry = fit_geometry(
        ImageSize {
            width: src_w,
            height: src_h,
        },
        canvas,
    )?;
    debug!(
        src_w,
        src_h,
        scale = geometry.scale,
        width = geometry.size.width,
        height = geometry.size.height,
        "fitting image to canvas"
    );

    let resized = image.resize_exact(geometry.size.width, geometry.size.height, FilterType::Lanczos3);
    let mut base = RgbaImage::from_pixel(canvas.width(), canvas.height(), Rgba(canvas.pad_color().rgba()));
    let x = geometry.offset_x as i64;
    let y = geometry.offset_y as i64;
    if resized.color().has_alpha() {
        imageops::overlay(&mut base, &resized.to_rgba8(), x, y);
    } else {
        imageops::replace(&mut base, &resized.to_rgba8(), x, y);
    }

    let composed = DynamicImage::ImageRgba8(base);
    if format.supports_alpha() {
        Ok(composed)
    } else {
        Ok(DynamicImage::ImageRgb8(composed.to_rgb8()))
    }
}

pub fn fit_and_encode(
    image: &DynamicImage,
    canvas: &CanvasSpec,
    params: &EncodingParameters,
) -> Result<EncodeOutcome, CoreError> {
    let fitted = fit_to_canvas(image, canvas, params.format)?;
    encode_within_cap(&fitted, params)
}
