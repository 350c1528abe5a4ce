use crate::error::SwarmError;
use crate::ports::{FileInspector, PortFuture};
use crate::types::FileMetrics;
use std::path::Path;

/// Indentation-based size heuristics. Good enough for Python-style sources
/// and brace languages formatted with conventional indentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndentMetricsInspector;

const FUNCTION_KEYWORDS: [&str; 4] = ["def ", "async def ", "fn ", "function "];

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn declared_name<'a>(trimmed: &'a str, keywords: &[&str]) -> Option<&'a str> {
    let trimmed = trimmed
        .strip_prefix("pub ")
        .or_else(|| trimmed.strip_prefix("export "))
        .unwrap_or(trimmed);
    keywords.iter().find_map(|keyword| {
        let rest = trimmed.strip_prefix(keyword)?;
        let name_end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        (name_end > 0).then(|| &rest[..name_end])
    })
}

/// Index one past the last line belonging to the block opened at `start`.
fn block_end(lines: &[&str], start: usize) -> usize {
    let opener_indent = indent_of(lines[start]);
    let mut end = start + 1;
    for (offset, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        let closes_brace = line.trim_start().starts_with('}');
        if indent_of(line) <= opener_indent {
            if closes_brace {
                end = offset + 1;
            }
            break;
        }
        end = offset + 1;
    }
    end
}

#[must_use]
pub fn measure_source(source: &str) -> FileMetrics {
    let lines: Vec<&str> = source.lines().collect();
    let mut functions = Vec::new();
    let mut classes = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if let Some(name) = declared_name(trimmed, &FUNCTION_KEYWORDS) {
            functions.push((name.to_string(), block_end(&lines, index) - index));
        } else if let Some(name) = declared_name(trimmed, &["class ", "struct ", "impl "]) {
            let end = block_end(&lines, index);
            let methods = lines[index + 1..end]
                .iter()
                .filter(|l| declared_name(l.trim_start(), &FUNCTION_KEYWORDS).is_some())
                .count();
            classes.push((name.to_string(), methods));
        }
    }

    FileMetrics {
        line_count: lines.len(),
        functions,
        classes,
    }
}

impl FileInspector for IndentMetricsInspector {
    /// A file that does not exist measures as empty.
    fn inspect<'a>(&'a self, path: &'a Path) -> PortFuture<'a, FileMetrics> {
        Box::pin(async move {
            match tokio::fs::read_to_string(path).await {
                Ok(source) => Ok(measure_source(&source)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileMetrics::default()),
                Err(e) => Err(SwarmError::CollaboratorError(format!(
                    "Cannot read {}: {e}",
                    path.display()
                ))),
            }
        })
    }
}
