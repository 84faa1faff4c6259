use image::GenericImageView;
use tracing::{debug, info};

use crate::{encode_png, GenerationError, GenerationRequest, ModelLike};

/// One generated image, already encoded for display and download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Rejects prompts that are empty or whitespace only.
pub fn validate_prompt(prompt: &str) -> Result<(), GenerationError> {
    if prompt.trim().is_empty() {
        debug!("rejecting blank prompt");
        return Err(GenerationError::EmptyPrompt);
    }
    Ok(())
}

/// Largest accepted image side, in pixels.
pub const MAX_IMAGE_SIDE: usize = 2048;
/// Largest accepted number of denoising steps.
pub const MAX_STEPS: usize = 1000;

/// Checks an image size: both sides non-zero multiples of 8, at most
/// [`MAX_IMAGE_SIDE`].
pub fn check_size(width: usize, height: usize) -> Result<(), GenerationError> {
    let valid = |side: usize| side > 0 && side % 8 == 0 && side <= MAX_IMAGE_SIDE;
    if !valid(width) || !valid(height) {
        return Err(GenerationError::InvalidRequest(format!(
            "width and height must be non-zero multiples of 8 up to {MAX_IMAGE_SIDE}, got {width}x{height}"
        )));
    }
    Ok(())
}

pub fn check_steps(steps: usize) -> Result<(), GenerationError> {
    if !(1..=MAX_STEPS).contains(&steps) {
        return Err(GenerationError::InvalidRequest(format!(
            "steps must be between 1 and {MAX_STEPS}, got {steps}"
        )));
    }
    Ok(())
}

/// Rejects a blank prompt and any explicit size or step count the pipeline
/// cannot run. Fields left as `None` are resolved by the model.
pub fn validate_request(request: &GenerationRequest) -> Result<(), GenerationError> {
    validate_prompt(&request.prompt)?;
    if request.width.is_some() || request.height.is_some() {
        // a missing side is checked against a valid stand-in
        check_size(request.width.unwrap_or(8), request.height.unwrap_or(8))?;
    }
    if let Some(steps) = request.steps {
        check_steps(steps)?;
    }
    if let Some(guidance) = request.guidance {
        if !guidance.is_finite() {
            return Err(GenerationError::InvalidRequest(format!(
                "guidance must be a finite number, got {guidance}"
            )));
        }
    }
    Ok(())
}

/// Validates the request, runs the model once and encodes the result as PNG.
///
/// Blank prompts and invalid requests never reach the model.
pub fn generate(
    model: &dyn ModelLike,
    request: GenerationRequest,
) -> Result<GeneratedImage, GenerationError> {
    validate_request(&request)?;

    info!(prompt = %request.prompt, "generating image");
    let image = model.run(request)?;
    let (width, height) = image.dimensions();
    let png = encode_png(&image)?;
    info!(width, height, bytes = png.len(), "image generated");

    Ok(GeneratedImage { png, width, height })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::DynamicImage;

    use super::*;

    struct CountingModel {
        calls: AtomicUsize,
        failure: Option<&'static str>,
    }

    impl CountingModel {
        fn new(failure: Option<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failure,
            }
        }
    }

    impl ModelLike for CountingModel {
        fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = self.failure {
                anyhow::bail!(msg);
            }
            let width = request.width.unwrap_or(16) as u32;
            let height = request.height.unwrap_or(8) as u32;
            Ok(DynamicImage::new_rgb8(width, height))
        }
    }

    #[test]
    fn blank_prompts_skip_the_model() {
        let model = CountingModel::new(None);
        for prompt in ["", " ", "\t\n", "   \r\n "] {
            let err = generate(&model, GenerationRequest::from_prompt(prompt)).unwrap_err();
            assert!(matches!(err, GenerationError::EmptyPrompt));
            assert_eq!(err.to_string(), "Por favor, digite um prompt.");
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn each_prompt_runs_the_model_once() {
        let model = CountingModel::new(None);
        generate(&model, GenerationRequest::from_prompt("a red bicycle")).unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        generate(&model, GenerationRequest::from_prompt("a red bicycle")).unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn png_matches_generated_dimensions() {
        let model = CountingModel::new(None);
        let request = GenerationRequest {
            width: Some(24),
            height: Some(40),
            ..GenerationRequest::from_prompt("a red bicycle")
        };
        let generated = generate(&model, request).unwrap();
        assert_eq!((generated.width, generated.height), (24, 40));

        let decoded =
            image::load_from_memory_with_format(&generated.png, image::ImageFormat::Png).unwrap();
        assert_eq!(decoded.dimensions(), (24, 40));
        assert_eq!(generated.png, encode_png(&DynamicImage::new_rgb8(24, 40)).unwrap());
    }

    #[test]
    fn size_bounds() {
        assert!(check_size(8, 8).is_ok());
        assert!(check_size(512, 768).is_ok());
        assert!(check_size(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE).is_ok());
        for (width, height) in [(0, 512), (512, 0), (7, 512), (512, 7), (513, 512)] {
            assert!(matches!(
                check_size(width, height),
                Err(GenerationError::InvalidRequest(_))
            ));
        }
        assert!(check_size(MAX_IMAGE_SIDE + 8, 512).is_err());
    }

    #[test]
    fn step_bounds() {
        assert!(check_steps(1).is_ok());
        assert!(check_steps(MAX_STEPS).is_ok());
        assert!(check_steps(0).is_err());
        assert!(check_steps(MAX_STEPS + 1).is_err());
    }

    #[test]
    fn invalid_requests_skip_the_model() {
        let model = CountingModel::new(None);
        let invalid = [
            GenerationRequest {
                steps: Some(0),
                ..GenerationRequest::from_prompt("a red bicycle")
            },
            GenerationRequest {
                width: Some(100_000),
                ..GenerationRequest::from_prompt("a red bicycle")
            },
            GenerationRequest {
                height: Some(7),
                ..GenerationRequest::from_prompt("a red bicycle")
            },
            GenerationRequest {
                guidance: Some(f64::NAN),
                ..GenerationRequest::from_prompt("a red bicycle")
            },
        ];
        for request in invalid {
            let err = generate(&model, request).unwrap_err();
            assert!(matches!(err, GenerationError::InvalidRequest(_)), "{err}");
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn model_failure_keeps_its_message() {
        let model = CountingModel::new(Some("out of memory"));
        let err = generate(&model, GenerationRequest::from_prompt("a red bicycle")).unwrap_err();
        assert!(matches!(err, GenerationError::Inference(_)));
        assert_eq!(err.to_string(), "out of memory");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
