//! Commit message and branch name formatting.
//!
//! Branch commits carry the transaction comment plus a column-aligned
//! `Accurev-*` trailer block describing the transaction and the streams it
//! touched. The `clean` style drops the block, the `notes` style moves it
//! into the raw notes namespace instead of the message body.

use crate::config::MessageStyle;
use crate::models::{Stream, Transaction};

/// A rendered commit message plus the text destined for the raw notes
/// namespace, if the style calls for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedMessage {
    pub message: String,
    pub note: Option<String>,
}

/// Renders commit messages in the configured style.
pub struct MessageFormatter {
    style: MessageStyle,
}

impl MessageFormatter {
    pub fn new(style: MessageStyle) -> Self {
        Self { style }
    }

    pub fn format(
        &self,
        transaction: &Transaction,
        stream: Option<&Stream>,
        dst_stream: Option<&Stream>,
        src_stream: Option<&Stream>,
    ) -> FormattedMessage {
        let comment = transaction
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        if self.style == MessageStyle::Clean {
            return FormattedMessage {
                message: comment.unwrap_or("").to_string(),
                note: None,
            };
        }

        let suffix = trailer_block(transaction, stream, dst_stream, src_stream);
        match self.style {
            MessageStyle::Normal => {
                let mut sections = Vec::new();
                if let Some(comment) = comment {
                    sections.push(comment.to_string());
                }
                sections.push(suffix);
                FormattedMessage {
                    message: sections.join("\n\n"),
                    note: None,
                }
            }
            MessageStyle::Notes => FormattedMessage {
                message: comment.unwrap_or("").to_string(),
                note: Some(suffix),
            },
            MessageStyle::Clean => unreachable!("handled above"),
        }
    }
}

/// Column-aligned trailer block. Titles are padded with spaces after the
/// colon so the values line up.
fn trailer_block(
    transaction: &Transaction,
    stream: Option<&Stream>,
    dst_stream: Option<&Stream>,
    src_stream: Option<&Stream>,
) -> String {
    let mut rows: Vec<(String, String)> = Vec::new();
    rows.push((
        "Accurev-transaction:".to_string(),
        format!("{} (type: {})", transaction.id, transaction.kind),
    ));
    if let Some(stream) = stream {
        append_stream_rows(&mut rows, "Accurev-stream", stream);
    }
    if let Some(stream) = dst_stream {
        append_stream_rows(&mut rows, "Accurev-dst-stream", stream);
    }
    if let Some(stream) = src_stream {
        append_stream_rows(&mut rows, "Accurev-src-stream", stream);
    }

    let widest = rows.iter().map(|(title, _)| title.len()).max().unwrap_or(0);
    rows.iter()
        .map(|(title, info)| format!("{:<width$} {}", title, info, width = widest))
        .collect::<Vec<_>>()
        .join("\n")
}

fn append_stream_rows(rows: &mut Vec<(String, String)>, prefix: &str, stream: &Stream) {
    rows.push((
        format!("{}:", prefix),
        format!(
            "{} (id: {}; type: {})",
            stream.name, stream.stream_number, stream.kind
        ),
    ));
    if let Some(prev_name) = &stream.prev_name {
        rows.push((format!("{}-prev-name:", prefix), prev_name.clone()));
    }
    if let Some(basis) = &stream.basis {
        let id = stream
            .basis_stream_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        rows.push((format!("{}-basis:", prefix), format!("{} (id: {})", basis, id)));
    }
    if let Some(prev_basis) = stream.prev_basis.as_deref().filter(|b| !b.is_empty()) {
        let id = stream
            .prev_basis_stream_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        rows.push((
            format!("{}-prev-basis:", prefix),
            format!("{} (id: {})", prev_basis, id),
        ));
    }
    if let Some(time_lock) = &stream.time_lock {
        rows.push((
            format!("{}-timelock:", prefix),
            format!("{} (UTC)", time_lock.format("%Y-%m-%d %H:%M:%S")),
        ));
    }
    if let Some(prev_time_lock) = &stream.prev_time_lock {
        rows.push((
            format!("{}-prev-timelock:", prefix),
            format!("{} (UTC)", prev_time_lock.format("%Y-%m-%d %H:%M:%S")),
        ));
    }
}

/// Stream names become branch names as-is apart from spaces.
pub fn sanitize_branch_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StreamKind, TransactionKind};
    use chrono::{TimeZone, Utc};

    fn stream(name: &str, number: u64, basis: Option<(&str, u64)>) -> Stream {
        Stream {
            name: name.to_string(),
            stream_number: number,
            depot_name: "widgets".to_string(),
            kind: StreamKind::Normal,
            basis: basis.map(|(n, _)| n.to_string()),
            basis_stream_number: basis.map(|(_, id)| id),
            prev_name: None,
            prev_basis: None,
            prev_basis_stream_number: None,
            time_lock: None,
            prev_time_lock: None,
        }
    }

    fn promote_transaction(comment: Option<&str>) -> Transaction {
        Transaction {
            id: 1234,
            kind: TransactionKind::Promote,
            user: "jbloggs".to_string(),
            time: Utc.timestamp_opt(1_325_000_000, 0).unwrap(),
            comment: comment.map(|c| c.to_string()),
            versions: Vec::new(),
        }
    }

    #[test]
    fn test_normal_style_aligns_columns() {
        let formatter = MessageFormatter::new(MessageStyle::Normal);
        let dst = stream("widgets_dev", 2, Some(("widgets", 1)));
        let src = stream("widgets_feature", 5, Some(("widgets_dev", 2)));
        let formatted = formatter.format(
            &promote_transaction(Some("Promote the parser fix.")),
            None,
            Some(&dst),
            Some(&src),
        );
        assert!(formatted.note.is_none());
        let mut sections = formatted.message.splitn(2, "\n\n");
        assert_eq!(sections.next(), Some("Promote the parser fix."));
        let block = sections.next().unwrap();
        assert!(block.contains("Accurev-transaction:"));
        assert!(block.contains("1234 (type: promote)"));
        assert!(block.contains("widgets_dev (id: 2; type: normal)"));
        assert!(block.contains("Accurev-src-stream-basis:"));

        // Longest title here is "Accurev-src-stream-basis:" (25 chars), so
        // every value starts at column 26.
        for line in block.lines() {
            let bytes = line.as_bytes();
            assert_eq!(bytes[25], b' ', "line not padded: {}", line);
            assert_ne!(bytes[26], b' ', "value misaligned: {}", line);
        }
    }

    #[test]
    fn test_clean_style_is_comment_only() {
        let formatter = MessageFormatter::new(MessageStyle::Clean);
        let formatted = formatter.format(
            &promote_transaction(Some("  Promote the parser fix.  ")),
            Some(&stream("widgets", 1, None)),
            None,
            None,
        );
        assert_eq!(formatted.message, "Promote the parser fix.");
        assert!(formatted.note.is_none());
    }

    #[test]
    fn test_notes_style_moves_trailer() {
        let formatter = MessageFormatter::new(MessageStyle::Notes);
        let formatted = formatter.format(
            &promote_transaction(None),
            Some(&stream("widgets", 1, None)),
            None,
            None,
        );
        assert_eq!(formatted.message, "");
        let note = formatted.note.unwrap();
        assert!(note.starts_with("Accurev-transaction:"));
        assert!(note.contains("widgets (id: 1; type: normal)"));
    }

    #[test]
    fn test_trailer_includes_rename_and_timelock() {
        let mut renamed = stream("widgets_new", 3, Some(("widgets", 1)));
        renamed.prev_name = Some("widgets_old".to_string());
        renamed.prev_basis = Some("widgets_root".to_string());
        renamed.prev_basis_stream_number = Some(9);
        renamed.time_lock = Some(Utc.timestamp_opt(1_325_553_600, 0).unwrap());

        let formatter = MessageFormatter::new(MessageStyle::Normal);
        let formatted = formatter.format(&promote_transaction(None), Some(&renamed), None, None);
        assert!(formatted.message.contains("Accurev-stream-prev-name:"));
        assert!(formatted.message.contains("widgets_old"));
        assert!(formatted.message.contains("widgets_root (id: 9)"));
        assert!(formatted
            .message
            .contains("Accurev-stream-timelock:"));
        assert!(formatted.message.contains("2012-01-03 01:20:00 (UTC)"));
    }

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("my stream"), "my_stream");
        assert_eq!(sanitize_branch_name("  padded  "), "padded");
        assert_eq!(sanitize_branch_name("widgets_dev"), "widgets_dev");
    }
}
