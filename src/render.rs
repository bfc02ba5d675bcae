pub mod admission;
pub mod cache;
pub mod compile;
pub mod images;
pub mod pipeline;
pub mod typesetter;

/// The product of a successful render.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub pdf: Vec<u8>,
    pub page_count: usize,
    /// Suggested download filename, surfaced via Content-Disposition.
    pub filename: String,
}
