/// Post bodies arrive as HTML; IRC wants plain text.
const WRAP_WIDTH: usize = 10_000;

/// Render a status body to plain text, one paragraph or `<br>` per line.
///
/// The width is large enough that html2text never wraps a post on its own.
pub fn textify(html: &str) -> Result<String, html2text::Error> {
    html2text::from_read(html.as_bytes(), WRAP_WIDTH)
}
