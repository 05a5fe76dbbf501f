use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, error};
use url::Url;

// EXT-X-KEY, EXT-X-MAP, EXT-X-MEDIA, EXT-X-I-FRAME-STREAM-INF and friends all carry their
// reference in a quoted URI attribute
static URI_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]*)""#).expect("URI attribute regex should compile"));

/// one line of a playlist, classified on its own with no state from the lines around it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistLine<'a> {
    Blank(&'a str),
    Directive(&'a str),
    UriDirective(&'a str),
    MediaReference(&'a str),
}

impl<'a> PlaylistLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            Self::Blank(line)
        } else if trimmed.starts_with('#') {
            if URI_ATTRIBUTE.is_match(line) {
                Self::UriDirective(line)
            } else {
                Self::Directive(line)
            }
        } else {
            Self::MediaReference(line)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaylistDocument<'a> {
    lines: Vec<PlaylistLine<'a>>,
    trailing_newline: bool,
}

impl<'a> PlaylistDocument<'a> {
    pub fn parse(text: &'a str) -> Self {
        Self {
            lines: text.lines().map(PlaylistLine::classify).collect(),
            trailing_newline: text.ends_with('\n'),
        }
    }

    pub fn lines(&self) -> &[PlaylistLine<'a>] {
        &self.lines
    }
}

/// rewrites every reference in a playlist so it points back at the proxy
///
/// text only, nothing referenced gets fetched or validated here. whatever the player asks for
/// next comes through the proxy and gets checked then
#[derive(Debug, Clone)]
pub struct PlaylistRewriter {
    proxy_path: String,
}

impl PlaylistRewriter {
    pub fn new(proxy_path: impl Into<String>) -> Self {
        Self {
            proxy_path: proxy_path.into(),
        }
    }

    pub fn proxy_path(&self) -> &str {
        &self.proxy_path
    }

    pub fn rewrite(&self, playlist_text: &str, base_url: &Url) -> String {
        let document = PlaylistDocument::parse(playlist_text);

        let lines: Vec<Cow<'_, str>> = document
            .lines()
            .iter()
            .map(|line| match *line {
                PlaylistLine::Blank(raw) | PlaylistLine::Directive(raw) => Cow::Borrowed(raw),
                PlaylistLine::UriDirective(raw) => self.rewrite_uri_attributes(raw, base_url),
                PlaylistLine::MediaReference(raw) => {
                    match self.proxy_reference_for(raw.trim(), base_url) {
                        Some(rewritten) => Cow::Owned(rewritten),
                        None => Cow::Borrowed(raw),
                    }
                }
            })
            .collect();

        let mut output = lines.join("\n");
        if document.trailing_newline {
            output.push('\n');
        }

        debug!(
            "rewrote playlist of {} lines against {}",
            document.lines().len(),
            base_url
        );

        output
    }

    fn rewrite_uri_attributes<'a>(&self, line: &'a str, base_url: &Url) -> Cow<'a, str> {
        URI_ATTRIBUTE.replace_all(line, |caps: &Captures| {
            let value = &caps[1];
            if value.is_empty() {
                return caps[0].to_string();
            }

            match self.proxy_reference_for(value, base_url) {
                Some(rewritten) => format!("URI=\"{}\"", rewritten),
                None => caps[0].to_string(),
            }
        })
    }

    /// resolves `reference` against `base_url` and returns the proxy form of it. references
    /// that already go through the proxy come back untouched so rewriting twice is a no-op.
    /// `None` when the reference can't be resolved
    pub fn proxy_reference_for(&self, reference: &str, base_url: &Url) -> Option<String> {
        if self.is_proxied(reference, base_url) {
            return Some(reference.to_string());
        }

        match base_url.join(reference) {
            Ok(resolved) => Some(self.proxy_reference(resolved.as_str())),
            Err(e) => {
                error!("Failed to resolve: {} - {}", reference, e);
                None
            }
        }
    }

    /// `<proxy_path>?url=<percent-encoded absolute url>`
    pub fn proxy_reference(&self, absolute_url: &str) -> String {
        format!(
            "{}?url={}",
            self.proxy_path,
            urlencoding::encode(absolute_url)
        )
    }

    // only a playlist that was itself fetched through the proxy can already hold proxy
    // references. on an upstream playlist a `/proxy?url=` path belongs to the upstream origin
    // and has to be rewritten like anything else
    fn is_proxied(&self, reference: &str, base_url: &Url) -> bool {
        if base_url.path() != self.proxy_path {
            return false;
        }

        match base_url.join(reference) {
            Ok(resolved) => {
                resolved.origin() == base_url.origin()
                    && resolved.path() == self.proxy_path
                    && resolved
                        .query_pairs()
                        .find(|(key, _)| key == "url")
                        .and_then(|(_, target)| Url::parse(&target).ok())
                        .is_some_and(|target| matches!(target.scheme(), "http" | "https"))
            }
            Err(_) => false,
        }
    }
}
