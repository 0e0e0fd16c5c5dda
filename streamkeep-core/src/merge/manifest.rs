//! Concat-demuxer manifest: one `file '<name>'` line per source, resolved
//! relative to the manifest's own directory.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::{CaptureError, Result};

pub fn manifest_line(name: &str) -> String {
    format!("file './{}'", name.replace('\'', r"'\''"))
}

/// File names listed in a manifest, in order. Lines that are not `file`
/// directives are ignored.
pub fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("file "))
        .map(|operand| unquote(operand.trim()))
        .map(|name| name.strip_prefix("./").map(str::to_string).unwrap_or(name))
        .filter(|name| !name.is_empty())
        .collect()
}

fn unquote(operand: &str) -> String {
    let mut out = String::with_capacity(operand.len());
    let mut quoted = false;
    let mut chars = operand.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// `None` when there is no manifest.
pub async fn read_manifest(path: &Path) -> Result<Option<Vec<String>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(parse_manifest(&text))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CaptureError::filesystem(path, err)),
    }
}

/// Append the names not already listed. Returns how many were added; the
/// file is not created when nothing is added.
pub async fn append_to_manifest(path: &Path, names: &[String]) -> Result<usize> {
    let existing = read_manifest(path).await?.unwrap_or_default();
    let mut fresh: Vec<&String> = Vec::new();
    for name in names {
        if !existing.contains(name) && !fresh.contains(&name) {
            fresh.push(name);
        }
    }
    if fresh.is_empty() {
        return Ok(0);
    }

    let mut text = String::new();
    for name in &fresh {
        text.push_str(&manifest_line(name));
        text.push('\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| CaptureError::filesystem(path, err))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|err| CaptureError::filesystem(path, err))?;
    file.flush()
        .await
        .map_err(|err| CaptureError::filesystem(path, err))?;
    Ok(fresh.len())
}

/// Replace the manifest with exactly `names`.
pub async fn write_manifest(path: &Path, names: &[String]) -> Result<()> {
    let text: String = names
        .iter()
        .map(|name| manifest_line(name) + "\n")
        .collect();
    tokio::fs::write(path, text)
        .await
        .map_err(|err| CaptureError::filesystem(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_round_trip_through_quoting() {
        let names = ["bob_compressed_2024.mkv", "it's_compressed_1.mkv"];
        let text: String = names
            .iter()
            .map(|name| manifest_line(name) + "\n")
            .collect();
        assert!(text.starts_with("file './bob_compressed_2024.mkv'\n"));
        assert_eq!(parse_manifest(&text), names);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = "# header\n\nfile 'a.mkv'\nduration 3\nfile './b.mkv'\n";
        assert_eq!(parse_manifest(text), vec!["a.mkv", "b.mkv"]);
    }

    #[tokio::test]
    async fn append_skips_names_already_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toMerge.txt");

        let first = vec!["a.mkv".to_string(), "b.mkv".to_string()];
        assert_eq!(append_to_manifest(&path, &first).await.expect("first"), 2);

        let second = vec!["b.mkv".to_string(), "c.mkv".to_string(), "c.mkv".to_string()];
        assert_eq!(append_to_manifest(&path, &second).await.expect("second"), 1);

        assert_eq!(
            read_manifest(&path).await.expect("read"),
            Some(vec!["a.mkv".into(), "b.mkv".into(), "c.mkv".into()])
        );
    }

    #[tokio::test]
    async fn rewrite_replaces_the_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toMerge.txt");
        let names = vec!["a.mkv".to_string(), "b.mkv".to_string()];
        append_to_manifest(&path, &names).await.expect("append");

        write_manifest(&path, &names[1..]).await.expect("rewrite");
        assert_eq!(
            read_manifest(&path).await.expect("read"),
            Some(vec!["b.mkv".into()])
        );
    }

    #[tokio::test]
    async fn nothing_to_add_creates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toMerge.txt");
        assert_eq!(append_to_manifest(&path, &[]).await.expect("append"), 0);
        assert!(!path.exists());
        assert_eq!(read_manifest(&path).await.expect("read"), None);
    }
}
