use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::result::{AnnotatedImage, Detection};
use crate::error::DetectError;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 14.0;
const LABEL_OFFSET: i32 = 16;

/// Load the label font. Labels are skipped when this returns `None`.
pub fn load_font(path: &Path) -> Option<FontArc> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("label font {} unreadable: {}", path.display(), err);
            return None;
        }
    };
    match FontArc::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("label font {} invalid: {}", path.display(), err);
            None
        }
    }
}

/// Draw boxes (and labels when a font is available) on a copy of `image` and
/// encode it as JPEG.
pub fn render_annotated(
    image: &RgbImage,
    detections: &[Detection],
    font: Option<&FontArc>,
) -> Result<AnnotatedImage, DetectError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectError::AnnotationRender("image has no pixels".into()));
    }

    let mut canvas = image.clone();
    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox.map(|v| v as i32);
        for inset in 0..BOX_THICKNESS {
            let w = (x2 - x1 - 2 * inset).max(1) as u32;
            let h = (y2 - y1 - 2 * inset).max(1) as u32;
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(x1 + inset, y1 + inset).of_size(w, h),
                BOX_COLOR,
            );
        }
        if let Some(font) = font {
            let label = format!("{} {:.2}", detection.class_label, detection.confidence);
            draw_text_mut(
                &mut canvas,
                BOX_COLOR,
                x1,
                (y1 - LABEL_OFFSET).max(0),
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }

    let mut jpeg = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .map_err(|e| DetectError::AnnotationRender(e.to_string()))?;

    Ok(AnnotatedImage {
        jpeg,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f64; 4]) -> Detection {
        Detection {
            class_label: "pistol".into(),
            confidence: 0.87,
            bbox,
            frame_index: None,
            time_offset_sec: None,
        }
    }

    #[test]
    fn renders_jpeg_with_box_pixels() {
        let image = RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]));
        let annotated = render_annotated(&image, &[detection([4.0, 4.0, 40.0, 30.0])], None).unwrap();
        assert_eq!((annotated.width, annotated.height), (64, 48));

        let decoded = image::load_from_memory(&annotated.jpeg).unwrap().to_rgb8();
        let corner = decoded.get_pixel(4, 10);
        assert!(corner[0] > 100, "expected a red box edge, got {:?}", corner);
    }

    #[test]
    fn degenerate_boxes_do_not_panic() {
        let image = RgbImage::new(8, 8);
        let annotated = render_annotated(&image, &[detection([3.0, 3.0, 3.0, 3.0])], None);
        assert!(annotated.is_ok());
    }

    #[test]
    fn empty_image_is_a_render_error() {
        let image = RgbImage::new(0, 0);
        assert!(matches!(
            render_annotated(&image, &[], None),
            Err(DetectError::AnnotationRender(_))
        ));
    }
}
