use cardscan_core::model::NormalizedImage;
use cardscan_core::validation::validate_image;
use cardscan_dispatch::{InvalidImage, Preprocessor};

/// Checks size and container format; the bytes are passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImagePreprocessor;

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, raw: &[u8]) -> Result<NormalizedImage, InvalidImage> {
        let format = validate_image(raw)?;
        Ok(NormalizedImage::new(format, raw))
    }
}
