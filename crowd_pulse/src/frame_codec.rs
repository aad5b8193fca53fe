//! Annotation and JPEG/base64 encoding of live frames.

use crate::core_modules::anomaly::AnomalyKind;
use crate::core_modules::detection::Frame;
use crate::pipeline::FrameAnalysis;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const FALLEN_MARKER_RADIUS: i32 = 30;
const BANNER_HEIGHT: u32 = 24;
const HIGH_CONFIDENCE: f32 = 0.7;

/// Draws detections and anomaly markers onto a copy of the frame.
pub fn annotate(frame: &Frame, analysis: &FrameAnalysis) -> RgbImage {
    let mut canvas = frame.image.clone();
    let (w, h) = (canvas.width(), canvas.height());
    if w == 0 || h == 0 {
        return canvas;
    }

    for d in &analysis.detections {
        let color = if d.confidence > HIGH_CONFIDENCE { GREEN } else { YELLOW };
        let x = d.bbox.x1 as i32;
        let y = d.bbox.y1 as i32;
        let bw = (d.bbox.width() as u32).max(1);
        let bh = (d.bbox.height() as u32).max(1);
        draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(bw, bh), color);
        // second pass for a 2px outline
        if bw > 2 && bh > 2 {
            draw_hollow_rect_mut(&mut canvas, Rect::at(x + 1, y + 1).of_size(bw - 2, bh - 2), color);
        }
    }

    for anomaly in &analysis.anomalies {
        match anomaly.kind {
            AnomalyKind::FallenPerson => {
                let center = (anomaly.location[0] as i32, anomaly.location[1] as i32);
                draw_hollow_circle_mut(&mut canvas, center, FALLEN_MARKER_RADIUS, RED);
            }
            AnomalyKind::Stampede => {
                draw_filled_rect_mut(&mut canvas, Rect::at(0, 0).of_size(w, BANNER_HEIGHT.min(h)), RED);
            }
            AnomalyKind::HighDensityCluster => {}
        }
    }
    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

/// `data:image/jpeg;base64,...` for the annotated frame.
pub fn live_frame_data_url(frame: &Frame, analysis: &FrameAnalysis, quality: u8) -> Result<String, ImageError> {
    let jpeg = encode_jpeg(&annotate(frame, analysis), quality)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}
