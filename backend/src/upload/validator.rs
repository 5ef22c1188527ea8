use image::{DynamicImage, ImageReader};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};

use super::signature::ImageSignature;

pub const MIN_DIMENSION: u32 = 10;
pub const MAX_DIMENSION: u32 = 5000;

/// A file received on the prediction endpoint. Lives for a single request.
#[derive(Debug, Clone, Default)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Size announced by the client, if any. Not trusted on its own.
    pub declared_size: Option<usize>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn measured_size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_file_size: usize,
    pub allowed_extensions: BTreeSet<String>,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl UploadLimits {
    pub fn new(max_file_size: usize, allowed_extensions: impl IntoIterator<Item = String>) -> Self {
        Self {
            max_file_size,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            min_dimension: MIN_DIMENSION,
            max_dimension: MAX_DIMENSION,
        }
    }

    fn allowed_list(&self) -> String {
        self.allowed_extensions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Uploaded file has no filename")]
    MissingFilename,
    #[error("Filename '{0}' has no extension")]
    MissingExtension(String),
    #[error("Extension '.{extension}' is not allowed. Allowed extensions: {allowed}")]
    DisallowedExtension { extension: String, allowed: String },
    #[error("Content type '{0}' is not an image type")]
    InvalidContentType(String),
    #[error("File is {size} bytes, the maximum allowed size is {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("File contents do not match a PNG, JPEG or WEBP signature")]
    UnknownSignature,
    #[error("Image is {width}x{height} pixels, both sides must be between {min} and {max}")]
    BadDimensions {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },
    #[error("File could not be read as an image")]
    Unreadable,
}

impl Rejection {
    /// Short headline used as the `error` field of the 400 response; the
    /// `Display` text is the user-facing detail.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingFilename
            | Rejection::MissingExtension(_)
            | Rejection::DisallowedExtension { .. } => "Invalid file type",
            Rejection::InvalidContentType(_) => "Invalid content type",
            Rejection::TooLarge { .. } => "File too large",
            Rejection::UnknownSignature => "Invalid file signature",
            Rejection::BadDimensions { .. } => "Invalid image dimensions",
            Rejection::Unreadable => "Invalid file",
        }
    }
}

/// Upload that passed every check, with what was learned along the way.
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub signature: ImageSignature,
    pub width: u32,
    pub height: u32,
    /// Fully decoded pixels, handed on to preprocessing.
    pub image: DynamicImage,
}

pub type ValidationResult = Result<ValidatedUpload, Rejection>;

#[derive(Debug, Clone)]
pub struct UploadValidator {
    limits: UploadLimits,
}

impl UploadValidator {
    pub fn new(limits: UploadLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Runs the checks in order and stops at the first failure: extension,
    /// declared content type, size, magic bytes, then pixel dimensions.
    ///
    /// Dimensions are checked from the header before the pixel data is
    /// decoded, so an oversized canvas is refused without allocating it. A
    /// stream whose header is fine but whose pixel data is corrupt or
    /// truncated is `Unreadable`.
    pub fn validate(&self, file: &UploadedFile) -> ValidationResult {
        self.check_extension(file)?;
        self.check_content_type(file)?;
        self.check_size(file)?;
        let signature = ImageSignature::sniff(&file.bytes).ok_or(Rejection::UnknownSignature)?;
        let (width, height) = read_dimensions(&file.bytes, signature)?;
        self.check_dimensions(width, height)?;
        let image = decode_pixels(&file.bytes, signature)?;

        Ok(ValidatedUpload {
            signature,
            width,
            height,
            image,
        })
    }

    fn check_extension(&self, file: &UploadedFile) -> Result<(), Rejection> {
        let filename = file
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(Rejection::MissingFilename)?;

        let extension = match filename.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => return Err(Rejection::MissingExtension(filename.to_string())),
        };

        if !self.limits.allowed_extensions.contains(&extension) {
            return Err(Rejection::DisallowedExtension {
                extension,
                allowed: self.limits.allowed_list(),
            });
        }
        Ok(())
    }

    fn check_content_type(&self, file: &UploadedFile) -> Result<(), Rejection> {
        match file.content_type.as_deref() {
            Some(ct) if !ct.to_ascii_lowercase().starts_with("image/") => {
                Err(Rejection::InvalidContentType(ct.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn check_size(&self, file: &UploadedFile) -> Result<(), Rejection> {
        let max = self.limits.max_file_size;
        let size = file
            .declared_size
            .unwrap_or(0)
            .max(file.measured_size());
        if size > max {
            return Err(Rejection::TooLarge { size, max });
        }
        Ok(())
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<(), Rejection> {
        let range = self.limits.min_dimension..=self.limits.max_dimension;
        if !range.contains(&width) || !range.contains(&height) {
            return Err(Rejection::BadDimensions {
                width,
                height,
                min: self.limits.min_dimension,
                max: self.limits.max_dimension,
            });
        }
        Ok(())
    }
}

/// Reads the pixel size from the image header without decoding pixel data.
fn read_dimensions(data: &[u8], signature: ImageSignature) -> Result<(u32, u32), Rejection> {
    guarded(signature, "header", || {
        ImageReader::with_format(Cursor::new(data), signature.format()).into_dimensions()
    })
}

fn decode_pixels(data: &[u8], signature: ImageSignature) -> Result<DynamicImage, Rejection> {
    guarded(signature, "pixel data", || {
        ImageReader::with_format(Cursor::new(data), signature.format()).decode()
    })
}

/// Runs a decoder step. Decoder errors and decoder panics both end up as
/// `Unreadable`.
fn guarded<T>(
    signature: ImageSignature,
    stage: &str,
    step: impl FnOnce() -> image::ImageResult<T>,
) -> Result<T, Rejection> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::debug!("{} {} rejected: {}", signature.name(), stage, e);
            Err(Rejection::Unreadable)
        }
        Err(_) => {
            log::warn!("{} decoder panicked while reading the {}", signature.name(), stage);
            Err(Rejection::Unreadable)
        }
    }
}
