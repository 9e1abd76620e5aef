//! Document text extraction.

use std::path::Path;

use crate::AnalyzerError;

/// Extract the text body of a document.
///
/// PDFs go through a page-by-page text walk; anything else is treated as
/// UTF-8 text (lossy). A document with no extractable text yields a fixed
/// placeholder rather than an error, so the analysis can still report on it.
pub fn extract_text(path: &Path) -> Result<String, AnalyzerError> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let mut text = if is_pdf {
        extract_pdf_text(path)?
    } else {
        let bytes = std::fs::read(path)
            .map_err(|e| AnalyzerError::Document(format!("{}: {e}", path.display())))?;
        String::from_utf8_lossy(&bytes).into_owned()
    };

    // Collapse blank-line runs left behind by layout-preserving extraction.
    while text.contains("\n\n") {
        text = text.replace("\n\n", "\n");
    }

    if text.trim().is_empty() {
        return Ok("No text content found in the document.".to_string());
    }
    Ok(text)
}

fn extract_pdf_text(path: &Path) -> Result<String, AnalyzerError> {
    let doc = lopdf::Document::load(path)
        .map_err(|e| AnalyzerError::Document(format!("{}: {e}", path.display())))?;

    let mut text = String::new();
    for (page_num, _) in doc.get_pages() {
        if let Ok(page_text) = doc.extract_text(&[page_num]) {
            text.push_str(&page_text);
            text.push('\n');
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn reads_plain_text() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Revenue grew 12% to $4.2M.").unwrap();

        let text = extract_text(file.path()).unwrap();
        assert!(text.contains("$4.2M"));
    }

    #[test]
    fn collapses_blank_line_runs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "alpha\n\n\n\nbeta").unwrap();

        assert_eq!(extract_text(file.path()).unwrap(), "alpha\nbeta");
    }

    #[test]
    fn empty_document_yields_placeholder() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let text = extract_text(file.path()).unwrap();
        assert_eq!(text, "No text content found in the document.");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = extract_text(Path::new("/nonexistent/report.txt")).unwrap_err();
        assert!(matches!(err, AnalyzerError::Document(_)));
    }
}
