//! Feed fetching and normalization.
//!
//! Retrieves a subscription source's feed over HTTP and parses it into a
//! normalized list of [`Entry`] values. Both RSS 2.0 and Atom formats are
//! supported; content is tried as RSS first with an Atom fallback.

use chrono::Utc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::Entry;

/// Fetches and parses subscription feeds
pub struct FeedFetcher {
    /// HTTP client for fetching feeds
    http_client: reqwest::Client,
}

impl FeedFetcher {
    /// Create a new feed fetcher
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new() -> Result<Self> {
        // Create HTTP client with reasonable timeout (30 seconds)
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("feedpipe feed reader")
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Fetch a feed and parse it into normalized entries
    ///
    /// # Errors
    /// Returns error if:
    /// - HTTP request fails or returns a non-success status
    /// - Feed cannot be parsed as either RSS or Atom
    pub async fn fetch(&self, url: &str) -> Result<Vec<Entry>> {
        debug!(url, "Fetching feed");

        let response = self.http_client.get(url).send().await?;

        // Check HTTP status before trying to parse the response body
        let status = response.status();
        if !status.is_success() {
            return Err(Error::FeedParse(format!(
                "feed returned HTTP {}: {}",
                status.as_u16(),
                url
            )));
        }

        let content = response.text().await?;
        self.parse(&content)
    }

    /// Parse feed content, trying RSS first and falling back to Atom
    pub fn parse(&self, content: &str) -> Result<Vec<Entry>> {
        match Self::parse_as_rss(content) {
            Ok(entries) => {
                debug!(count = entries.len(), "Parsed feed as RSS");
                Ok(entries)
            }
            Err(rss_err) => match Self::parse_as_atom(content) {
                Ok(entries) => {
                    debug!(count = entries.len(), "Parsed feed as Atom");
                    Ok(entries)
                }
                Err(atom_err) => Err(Error::FeedParse(format!(
                    "not RSS ({}) and not Atom ({})",
                    rss_err, atom_err
                ))),
            },
        }
    }

    fn parse_as_rss(content: &str) -> Result<Vec<Entry>> {
        let channel = content
            .parse::<rss::Channel>()
            .map_err(|e| Error::FeedParse(format!("RSS parse error: {}", e)))?;

        let entries = channel
            .items()
            .iter()
            .map(|item| {
                // Stable id: prefer guid, fall back to link, then title
                let id = item
                    .guid()
                    .map(|g| g.value().to_string())
                    .or_else(|| item.link().map(|l| l.to_string()))
                    .unwrap_or_else(|| item.title().unwrap_or("").to_string());

                let published = item.pub_date().and_then(|date_str| {
                    chrono::DateTime::parse_from_rfc2822(date_str)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                });

                // Download candidate: prefer the enclosure URL over the item link
                let link = item
                    .enclosure()
                    .map(|enc| enc.url().to_string())
                    .or_else(|| item.link().map(|l| l.to_string()));

                Entry {
                    id,
                    link,
                    title: item.title().map(|t| t.to_string()),
                    description: item.description().map(|d| d.to_string()),
                    published,
                }
            })
            .collect();

        Ok(entries)
    }

    fn parse_as_atom(content: &str) -> Result<Vec<Entry>> {
        let feed = atom_syndication::Feed::read_from(content.as_bytes())
            .map_err(|e| Error::FeedParse(format!("Atom parse error: {}", e)))?;

        let entries = feed
            .entries()
            .iter()
            .map(|entry| {
                let published = entry
                    .published()
                    .or_else(|| Some(entry.updated()))
                    .and_then(|dt| {
                        chrono::DateTime::parse_from_rfc3339(&dt.to_rfc3339())
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc))
                    });

                // Prefer an enclosure link, then the first link
                let link = entry
                    .links()
                    .iter()
                    .find(|link| link.rel() == "enclosure")
                    .or_else(|| entry.links().first())
                    .map(|link| link.href().to_string());

                let description = entry.summary().map(|s| s.as_str().to_string()).or_else(|| {
                    entry
                        .content()
                        .and_then(|c| c.value().map(|v| v.to_string()))
                });

                Entry {
                    id: entry.id().to_string(),
                    link,
                    title: Some(entry.title().as_str().to_string()),
                    description,
                    published,
                }
            })
            .collect();

        Ok(entries)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const RSS_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Releases</title>
    <link>https://example.com</link>
    <description>test feed</description>
    <item>
      <title>Show 1080p</title>
      <link>https://example.com/show-1080p</link>
      <guid>release-1</guid>
      <pubDate>Sat, 01 Mar 2025 12:00:00 GMT</pubDate>
      <enclosure url="https://example.com/show-1080p.torrent" length="1000" type="application/x-bittorrent"/>
    </item>
    <item>
      <title>Show 480p</title>
      <link>https://example.com/show-480p</link>
      <guid>release-2</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM_SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Releases</title>
  <id>urn:feed</id>
  <updated>2025-03-01T12:00:00Z</updated>
  <entry>
    <title>Show 1080p</title>
    <id>urn:release-1</id>
    <updated>2025-03-01T12:00:00Z</updated>
    <link rel="enclosure" href="https://example.com/show-1080p.torrent"/>
    <link href="https://example.com/show-1080p"/>
    <summary>weekly episode</summary>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_entries_with_enclosure_preference() {
        let fetcher = FeedFetcher::new().unwrap();
        let entries = fetcher.parse(RSS_SAMPLE).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "release-1");
        assert_eq!(entries[0].title.as_deref(), Some("Show 1080p"));
        assert_eq!(
            entries[0].link.as_deref(),
            Some("https://example.com/show-1080p.torrent")
        );
        assert!(entries[0].published.is_some());

        // No enclosure: falls back to the item link
        assert_eq!(
            entries[1].link.as_deref(),
            Some("https://example.com/show-480p")
        );
        assert!(entries[1].published.is_none());
    }

    #[test]
    fn falls_back_to_atom() {
        let fetcher = FeedFetcher::new().unwrap();
        let entries = fetcher.parse(ATOM_SAMPLE).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "urn:release-1");
        assert_eq!(
            entries[0].link.as_deref(),
            Some("https://example.com/show-1080p.torrent")
        );
        assert_eq!(entries[0].description.as_deref(), Some("weekly episode"));
    }

    #[test]
    fn rejects_garbage_with_both_diagnostics() {
        let fetcher = FeedFetcher::new().unwrap();
        let err = fetcher.parse("not a feed at all").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("RSS"), "diagnostic should mention RSS: {text}");
        assert!(text.contains("Atom"), "diagnostic should mention Atom: {text}");
    }
}
