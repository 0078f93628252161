//! Parsers for AccuRev CLI output.
//!
//! The `-fx` listings are shallow, attribute-heavy XML; they are parsed with
//! plain string scanning rather than an XML crate. Attribute extraction
//! checks the character before each match so `name=` never matches inside
//! `depotName=`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AccuRevError;
use crate::models::{
    Depot, DiffReport, ElementVersion, Stream, StreamKind, StreamSnapshot, Transaction,
    TransactionKind,
};

/// Session information from `accurev info`, plain `key: value` lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub principal: String,
    pub server_name: Option<String>,
    pub port: Option<String>,
}

impl SessionInfo {
    /// Whether a principal is logged in at all.
    pub fn is_logged_in(&self) -> bool {
        !self.principal.is_empty() && self.principal != "(not logged in)"
    }
}

pub fn parse_info(text: &str) -> Result<SessionInfo, AccuRevError> {
    debug!("parsing accurev info output ({} bytes)", text.len());
    let mut principal = None;
    let mut server_name = None;
    let mut port = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Principal" => principal = Some(value.trim().to_string()),
            "Server name" => server_name = Some(value.trim().to_string()),
            "Port" => port = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let principal = principal
        .ok_or_else(|| AccuRevError::XmlParseError("missing Principal in accurev info".into()))?;
    Ok(SessionInfo {
        principal,
        server_name,
        port,
    })
}

pub fn parse_depots(xml: &str) -> Result<Vec<Depot>, AccuRevError> {
    debug!("parsing depots XML ({} bytes)", xml.len());
    let mut depots = Vec::new();
    let parts: Vec<&str> = xml.split("<Element ").collect();
    for part in parts.iter().skip(1) {
        let fragment = match part.find("/>") {
            Some(pos) => &part[..pos],
            None => continue,
        };
        let number = extract_attr(fragment, "Number").and_then(|s| s.parse::<u64>().ok());
        let name = extract_attr(fragment, "Name");
        match (number, name) {
            (Some(number), Some(name)) => depots.push(Depot { number, name }),
            _ => {
                return Err(AccuRevError::XmlParseError(
                    "depot element without Number/Name".into(),
                ))
            }
        }
    }
    debug!(count = depots.len(), "parsed depots");
    Ok(depots)
}

pub fn parse_streams(xml: &str) -> Result<StreamSnapshot, AccuRevError> {
    debug!("parsing streams XML ({} bytes)", xml.len());
    let mut streams = Vec::new();
    let parts: Vec<&str> = xml.split("<stream ").collect();
    for part in parts.iter().skip(1) {
        let fragment = match part.find("/>") {
            Some(pos) => &part[..pos],
            None => continue,
        };
        let name = extract_attr(fragment, "name").ok_or_else(|| {
            AccuRevError::XmlParseError("stream element without name attribute".into())
        })?;
        let stream_number = extract_attr(fragment, "streamNumber")
            .or_else(|| extract_attr(fragment, "id"))
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                AccuRevError::XmlParseError(format!("stream '{}' without a number", name))
            })?;
        let kind = extract_attr(fragment, "type")
            .map(|s| StreamKind::from_str_val(&s))
            .unwrap_or_default();
        streams.push(Stream {
            name,
            stream_number,
            depot_name: extract_attr(fragment, "depotName").unwrap_or_default(),
            kind,
            basis: extract_attr(fragment, "basis"),
            basis_stream_number: extract_attr(fragment, "basisStreamNumber")
                .or_else(|| extract_attr(fragment, "basisStreamId"))
                .and_then(|s| s.parse().ok()),
            prev_name: extract_attr(fragment, "prevName"),
            prev_basis: extract_attr(fragment, "prevBasis"),
            prev_basis_stream_number: extract_attr(fragment, "prevBasisStreamNumber")
                .or_else(|| extract_attr(fragment, "prevBasisStreamId"))
                .and_then(|s| s.parse().ok()),
            time_lock: extract_attr(fragment, "time").and_then(|s| parse_epoch(&s)),
            prev_time_lock: extract_attr(fragment, "prevTime").and_then(|s| parse_epoch(&s)),
        });
    }
    debug!(count = streams.len(), "parsed streams");
    Ok(StreamSnapshot { streams })
}

pub fn parse_hist(xml: &str) -> Result<Vec<Transaction>, AccuRevError> {
    debug!("parsing hist XML ({} bytes)", xml.len());
    let mut transactions = Vec::new();
    let parts: Vec<&str> = xml.split("<transaction ").collect();
    for part in parts.iter().skip(1) {
        let fragment = match part.find("</transaction>") {
            Some(pos) => &part[..pos],
            None => part,
        };
        // Transaction attributes all sit before the first '>', ahead of any
        // nested version elements.
        let head = match fragment.find('>') {
            Some(pos) => &fragment[..pos],
            None => fragment,
        };
        let id = extract_attr(head, "id")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                AccuRevError::XmlParseError("transaction element without id".into())
            })?;
        let kind_str = extract_attr(head, "type").ok_or_else(|| {
            AccuRevError::XmlParseError(format!("transaction {} without type", id))
        })?;
        let kind = TransactionKind::from_str_val(&kind_str).ok_or(
            AccuRevError::UnknownTransactionKind {
                kind: kind_str,
                transaction: id,
            },
        )?;
        let time = extract_attr(head, "time")
            .and_then(|s| parse_epoch(&s))
            .ok_or_else(|| {
                AccuRevError::XmlParseError(format!("transaction {} without time", id))
            })?;
        let user = extract_attr(head, "user").unwrap_or_default();
        let comment = extract_tag_content(fragment, "comment").filter(|c| !c.is_empty());
        transactions.push(Transaction {
            id,
            kind,
            user,
            time,
            comment,
            versions: parse_versions(fragment),
        });
    }
    debug!(count = transactions.len(), "parsed hist transactions");
    Ok(transactions)
}

fn parse_versions(fragment: &str) -> Vec<ElementVersion> {
    let mut versions = Vec::new();
    let parts: Vec<&str> = fragment.split("<version ").collect();
    for part in parts.iter().skip(1) {
        let v = match part.find("/>") {
            Some(pos) => &part[..pos],
            None => continue,
        };
        versions.push(ElementVersion {
            path: extract_attr(v, "path").map(|p| normalize_path(&p)).unwrap_or_default(),
            element_id: extract_attr(v, "eid").and_then(|s| s.parse().ok()),
            is_dir: extract_attr(v, "dir").as_deref() == Some("yes"),
            virtual_named: extract_attr(v, "virtualNamedVersion"),
            real_named: extract_attr(v, "realNamedVersion"),
            from_stream_name: extract_attr(v, "fromStreamName"),
            from_stream_number: extract_attr(v, "fromStreamNumber").and_then(|s| s.parse().ok()),
        });
    }
    versions
}

pub fn parse_diff(xml: &str) -> Result<DiffReport, AccuRevError> {
    debug!("parsing diff XML ({} bytes)", xml.len());
    let mut paths = Vec::new();
    let mut seen = std::collections::HashSet::new();
    // Both sides of every change are collected; a rename names the element
    // under the old path on one side and the new path on the other.
    for marker in ["<Stream1 ", "<Stream2 "] {
        let parts: Vec<&str> = xml.split(marker).collect();
        for part in parts.iter().skip(1) {
            let fragment = match part.find("/>") {
                Some(pos) => &part[..pos],
                None => continue,
            };
            if let Some(name) = extract_attr(fragment, "Name") {
                let normalized = normalize_path(&name);
                if !normalized.is_empty() && seen.insert(normalized.clone()) {
                    paths.push(normalized);
                }
            }
        }
    }
    paths.sort();
    debug!(count = paths.len(), "parsed diff paths");
    Ok(DiffReport { paths })
}

/// Depot paths arrive as `\.\dir\file` or `/./dir/file`; reduce either to a
/// repository-relative `dir/file`.
pub fn normalize_path(raw: &str) -> String {
    let mut p = raw.replace('\\', "/");
    while let Some(rest) = p.strip_prefix('/') {
        p = rest.to_string();
    }
    if let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    p
}

/// Replace the per-invocation `TaskId` attribute so identical queries store
/// byte-identical XML.
pub fn normalize_task_id(xml: &str) -> String {
    let re = match regex_lite::Regex::new(r#"TaskId="[0-9]+""#) {
        Ok(re) => re,
        Err(_) => return xml.to_string(),
    };
    re.replace_all(xml, "TaskId=\"0\"").into_owned()
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search_from = 0;
    while let Some(rel_pos) = xml[search_from..].find(&open) {
        let start_pos = search_from + rel_pos;
        let after_open = &xml[start_pos + open.len()..];
        // Ensure we matched the tag exactly (next char must be '>' or whitespace for attributes)
        if let Some(ch) = after_open.chars().next() {
            if ch != '>' && !ch.is_ascii_whitespace() {
                search_from = start_pos + open.len();
                continue;
            }
        }
        let content_start = match after_open.find('>') {
            Some(pos) => pos + 1,
            None => return None,
        };
        let content = &after_open[content_start..];
        let end_pos = content.find(&close)?;
        return Some(xml_unescape(content[..end_pos].trim()));
    }
    None
}

fn extract_attr(s: &str, attr: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", attr, quote);
        let mut search_from = 0;
        while let Some(rel_pos) = s[search_from..].find(&pattern) {
            let pos = search_from + rel_pos;
            // Attribute names are preceded by whitespace; reject suffix
            // matches such as `Name=` inside `prevName=`.
            let at_boundary = s[..pos]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_whitespace())
                .unwrap_or(true);
            if !at_boundary {
                search_from = pos + pattern.len();
                continue;
            }
            let after = &s[pos + pattern.len()..];
            let end = after.find(quote)?;
            return Some(xml_unescape(&after[..end]));
        }
    }
    None
}

/// Unescape standard XML entities.
fn xml_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let text = "Shell:          /bin/bash\n\
                    Principal:      jdoe\n\
                    Host:           buildbox\n\
                    Server name:    accurev.example.com\n\
                    Port:           5050\n";
        let info = parse_info(text).unwrap();
        assert_eq!(info.principal, "jdoe");
        assert!(info.is_logged_in());
        assert_eq!(info.server_name.as_deref(), Some("accurev.example.com"));
    }

    #[test]
    fn test_parse_info_not_logged_in() {
        let text = "Principal:      (not logged in)\nPort: 5050\n";
        let info = parse_info(text).unwrap();
        assert!(!info.is_logged_in());
    }

    #[test]
    fn test_parse_depots() {
        let xml = r#"<AcResponse Command="show depots" TaskId="417">
<Element Number="1" Name="Widgets" Slice="1" exclusiveLocking="false" case="insensitive"/>
<Element Number="2" Name="Gadgets &amp; More" Slice="2" exclusiveLocking="false" case="insensitive"/>
</AcResponse>"#;
        let depots = parse_depots(xml).unwrap();
        assert_eq!(depots.len(), 2);
        assert_eq!(depots[0], Depot { number: 1, name: "Widgets".into() });
        assert_eq!(depots[1].name, "Gadgets & More");
    }

    #[test]
    fn test_parse_streams_attribute_boundaries() {
        // depotName before name: prefix-collision must not swallow `name`.
        let xml = r#"<AcResponse Command="show streams" TaskId="99">
<stream basis="Widgets" basisStreamNumber="1" depotName="Widgets" streamNumber="2" isDynamic="true" name="Widgets_int" startTime="1325006995" type="normal"/>
<stream depotName="Widgets" streamNumber="1" isDynamic="true" name="Widgets" startTime="1325006990" type="normal"/>
<stream basis="Widgets_int" basisStreamNumber="2" depotName="Widgets" streamNumber="3" name="ws_jdoe" prevName="old_ws" type="workspace" time="1326000000"/>
</AcResponse>"#;
        let snapshot = parse_streams(xml).unwrap();
        assert_eq!(snapshot.streams.len(), 3);

        let int_stream = snapshot.by_name("Widgets_int").unwrap();
        assert_eq!(int_stream.stream_number, 2);
        assert_eq!(int_stream.basis.as_deref(), Some("Widgets"));
        assert_eq!(int_stream.basis_stream_number, Some(1));
        assert_eq!(int_stream.depot_name, "Widgets");

        let root = snapshot.by_number(1).unwrap();
        assert_eq!(root.name, "Widgets");
        assert!(root.basis.is_none());

        let ws = snapshot.by_number(3).unwrap();
        assert!(ws.is_workspace());
        assert_eq!(ws.prev_name.as_deref(), Some("old_ws"));
        assert!(ws.time_lock.is_some());
    }

    #[test]
    fn test_parse_hist_promote() {
        let xml = r#"<AcResponse Command="hist" TaskId="311">
<transaction id="17" type="promote" time="1325261000" user="jdoe">
<comment>promote &lt;main&gt; work</comment>
<version path="/./src/main.c" eid="4" virtual="2/3" real="3/7" virtualNamedVersion="Widgets_int/3" realNamedVersion="ws_jdoe/7" elem_type="text" dir="no" fromStreamName="Widgets_dev" fromStreamNumber="3"/>
<version path="/./src" eid="2" virtual="2/2" real="3/2" virtualNamedVersion="Widgets_int/2" realNamedVersion="ws_jdoe/2" elem_type="dir" dir="yes"/>
</transaction>
</AcResponse>"#;
        let trs = parse_hist(xml).unwrap();
        assert_eq!(trs.len(), 1);
        let tr = &trs[0];
        assert_eq!(tr.id, 17);
        assert_eq!(tr.kind, TransactionKind::Promote);
        assert_eq!(tr.user, "jdoe");
        assert_eq!(tr.comment.as_deref(), Some("promote <main> work"));
        assert_eq!(tr.versions.len(), 2);
        assert_eq!(tr.versions[0].path, "src/main.c");
        assert!(!tr.versions[0].is_dir);
        assert!(tr.versions[1].is_dir);
        assert_eq!(tr.to_stream(), Some("Widgets_int"));
        assert_eq!(tr.from_stream(), Some(("Widgets_dev", Some(3))));
    }

    #[test]
    fn test_parse_hist_mkstream_has_no_versions() {
        let xml = r#"<AcResponse Command="hist" TaskId="5">
<transaction id="2" type="mkstream" time="1325007000" user="admin"/>
</AcResponse>"#;
        let trs = parse_hist(xml).unwrap();
        assert_eq!(trs.len(), 1);
        assert_eq!(trs[0].kind, TransactionKind::MkStream);
        assert!(trs[0].versions.is_empty());
        assert!(trs[0].comment.is_none());
        assert!(trs[0].to_stream().is_none());
    }

    #[test]
    fn test_parse_hist_rejects_unknown_kind() {
        let xml = r#"<AcResponse Command="hist" TaskId="5">
<transaction id="9" type="dispatch" time="1325007000" user="admin"/>
</AcResponse>"#;
        let err = parse_hist(xml).unwrap_err();
        assert!(matches!(
            err,
            AccuRevError::UnknownTransactionKind { ref kind, transaction: 9 } if kind == "dispatch"
        ));
    }

    #[test]
    fn test_parse_diff_collects_both_sides() {
        let xml = r#"<AcResponse Command="diff" TaskId="77">
<Element>
<Change Type="Content">
<Stream1 Name="\.\src\main.c" Version="2/3"/>
<Stream2 Name="\.\src\main.c" Version="2/4"/>
</Change>
</Element>
<Element>
<Change Type="Moved">
<Stream1 Name="\.\docs\old.txt" Version="2/1"/>
<Stream2 Name="\.\docs\new.txt" Version="2/2"/>
</Change>
</Element>
</AcResponse>"#;
        let diff = parse_diff(xml).unwrap();
        assert_eq!(
            diff.paths,
            vec!["docs/new.txt", "docs/old.txt", "src/main.c"]
        );
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_parse_diff_empty() {
        let xml = r#"<AcResponse Command="diff" TaskId="77"/>"#;
        let diff = parse_diff(xml).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(r"\.\src\main.c"), "src/main.c");
        assert_eq!(normalize_path("/./src/main.c"), "src/main.c");
        assert_eq!(normalize_path("src/main.c"), "src/main.c");
    }

    #[test]
    fn test_normalize_task_id() {
        let xml = r#"<AcResponse Command="hist" TaskId="31337"><transaction id="1"/></AcResponse>"#;
        let normalized = normalize_task_id(xml);
        assert!(normalized.contains(r#"TaskId="0""#));
        assert!(!normalized.contains("31337"));
        // Idempotent on already-normalized input.
        assert_eq!(normalize_task_id(&normalized), normalized);
    }

    #[test]
    fn test_extract_attr_boundary() {
        let fragment = r#"depotName="Widgets" id="2" name="Widgets_int""#;
        assert_eq!(extract_attr(fragment, "name").as_deref(), Some("Widgets_int"));
        assert_eq!(extract_attr(fragment, "depotName").as_deref(), Some("Widgets"));
    }
}
