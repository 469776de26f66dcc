use askama::Template;
use ns_lib::{ListPage, NsPath};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;

// Characters left as-is in a single path segment of a listing link.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Paging parameters of a listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub limit: u32,
    pub last_file_name: Option<String>,
}

impl ListingQuery {
    /// Reads `limit` and `lastFileName`; a missing, zero or unparsable limit
    /// falls back to `default_limit`.
    pub fn parse(raw_query: &str, default_limit: u32) -> Self {
        let mut query = Self {
            limit: default_limit,
            last_file_name: None,
        };
        for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            match key.as_ref() {
                "limit" => {
                    query.limit = value
                        .parse::<u32>()
                        .ok()
                        .filter(|v| *v > 0)
                        .unwrap_or(default_limit);
                }
                "lastFileName" if !value.is_empty() => {
                    query.last_file_name = Some(value.into_owned());
                }
                _ => {}
            }
        }
        query
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListingEntry {
    pub name: String,
    pub is_directory: bool,
    pub file_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListingReply {
    pub path: String,
    pub entries: Vec<ListingEntry>,
    pub limit: u32,
    pub last_file_name: String,
    pub should_display_load_more: bool,
}

impl ListingReply {
    pub fn new(dir: &NsPath, page: &ListPage, limit: u32) -> Self {
        Self {
            path: dir.to_string(),
            entries: page
                .entries
                .iter()
                .map(|entry| ListingEntry {
                    name: entry.name.clone(),
                    is_directory: entry.is_dir(),
                    file_id: entry.blob_id().map(|id| id.to_string()).unwrap_or_default(),
                })
                .collect(),
            limit,
            last_file_name: page.last_name.clone().unwrap_or_default(),
            should_display_load_more: page.has_more,
        }
    }
}

pub struct ListingRow {
    pub name: String,
    pub href: String,
    pub is_directory: bool,
    pub file_id: String,
}

#[derive(Template)]
#[template(path = "listing.html")]
pub struct ListingView {
    pub path: String,
    pub rows: Vec<ListingRow>,
    pub load_more_href: Option<String>,
}

impl ListingView {
    pub fn new(reply: &ListingReply) -> Self {
        let rows = reply
            .entries
            .iter()
            .map(|entry| {
                let mut href = utf8_percent_encode(&entry.name, SEGMENT).to_string();
                if entry.is_directory {
                    href.push('/');
                }
                ListingRow {
                    name: entry.name.clone(),
                    href,
                    is_directory: entry.is_directory,
                    file_id: entry.file_id.clone(),
                }
            })
            .collect();
        let load_more_href = if reply.should_display_load_more {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("limit", &reply.limit.to_string())
                .append_pair("lastFileName", &reply.last_file_name)
                .finish();
            Some(format!("?{}", query))
        } else {
            None
        };
        Self {
            path: reply.path.clone(),
            rows,
            load_more_href,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_lib::{BlobId, EntryKind, NamespaceEntry};

    #[test]
    fn test_parse_query() {
        assert_eq!(
            ListingQuery::parse("limit=2&lastFileName=b%20c", 100),
            ListingQuery {
                limit: 2,
                last_file_name: Some("b c".to_string()),
            }
        );
        assert_eq!(ListingQuery::parse("limit=abc", 100).limit, 100);
        assert_eq!(ListingQuery::parse("limit=0", 100).limit, 100);
        assert_eq!(ListingQuery::parse("", 50).last_file_name, None);
    }

    #[test]
    fn test_reply_and_view() {
        let dir = NsPath::new("/docs");
        let page = ListPage {
            entries: vec![
                NamespaceEntry::new(&dir, "a b.txt", EntryKind::File(BlobId::new(3, 1, 0x637037d6))),
                NamespaceEntry::new(&dir, "img", EntryKind::Dir),
            ],
            last_name: Some("img".to_string()),
            has_more: true,
        };
        let reply = ListingReply::new(&dir, &page, 2);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["Path"], "/docs");
        assert_eq!(json["Entries"][0]["FileId"], "3,01637037d6");
        assert_eq!(json["Entries"][1]["IsDirectory"], true);
        assert_eq!(json["LastFileName"], "img");
        assert_eq!(json["ShouldDisplayLoadMore"], true);

        let view = ListingView::new(&reply);
        assert_eq!(view.rows[0].href, "a%20b.txt");
        assert_eq!(view.rows[1].href, "img/");
        assert_eq!(
            view.load_more_href.as_deref(),
            Some("?limit=2&lastFileName=img")
        );
        let html = view.render().unwrap();
        assert!(html.contains("Load more"));
        assert!(html.contains("a b.txt"));
    }
}
