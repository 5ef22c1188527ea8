use image::ImageFormat;

/// Number of leading bytes inspected when sniffing a file format.
pub const SNIFF_LEN: usize = 32;

const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const RIFF_MAGIC: &[u8] = b"RIFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSignature {
    Png,
    Jpeg,
    Webp,
}

impl ImageSignature {
    /// Identifies the format from the leading bytes, ignoring whatever the
    /// client claimed in the filename or content type.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        let head = &data[..data.len().min(SNIFF_LEN)];
        if head.starts_with(PNG_MAGIC) {
            Some(ImageSignature::Png)
        } else if head.starts_with(JPEG_MAGIC) {
            Some(ImageSignature::Jpeg)
        } else if head.starts_with(RIFF_MAGIC) {
            Some(ImageSignature::Webp)
        } else {
            None
        }
    }

    pub fn format(self) -> ImageFormat {
        match self {
            ImageSignature::Png => ImageFormat::Png,
            ImageSignature::Jpeg => ImageFormat::Jpeg,
            ImageSignature::Webp => ImageFormat::WebP,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageSignature::Png => "PNG",
            ImageSignature::Jpeg => "JPEG",
            ImageSignature::Webp => "WEBP",
        }
    }
}
