// Request construction and reply parsing.
//
// The wire layer (codec) deals in raw word lists; this module gives them
// shape: a request is a command path plus `=key=value` parameter words and
// optional `?` query words, a reply is a kind marker plus a tag and an
// attribute map.

use indexmap::IndexMap;

use crate::error::Error;

/// Ordered key/value attributes of a single reply row.
///
/// Insertion order follows the device's word order, which matters for
/// display (RouterOS lists `.id` and `name` first for a reason).
pub type RowMap = IndexMap<String, String>;

// ── Request ──────────────────────────────────────────────────────────

/// A command request under construction.
///
/// # Example
///
/// ```
/// use roswire_proto::Request;
///
/// let req = Request::new("/ip/firewall/address-list/print")
///     .query("?list=blocklist");
/// assert_eq!(req.path(), "/ip/firewall/address-list/print");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    words: Vec<String>,
}

impl Request {
    /// Start a request for the given command path (e.g. `/interface/print`).
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            words: vec![path.into()],
        }
    }

    /// Append one `=key=value` parameter word.
    ///
    /// An empty value produces `=key=`, which RouterOS reads as a bare
    /// switch (e.g. `follow` on `/log/print`).
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!("={key}={value}"));
        self
    }

    /// Append every entry of a parameter map, in order, verbatim.
    pub fn params(mut self, params: &RowMap) -> Self {
        for (key, value) in params {
            self.words.push(format!("={key}={value}"));
        }
        self
    }

    /// Append a raw query word (`?name=value`, `?#|`, ...). Passed through
    /// untouched; the query mini-language belongs to the caller.
    pub fn query(mut self, query: &str) -> Self {
        self.words.push(query.to_string());
        self
    }

    /// The command path this request was created with.
    pub fn path(&self) -> &str {
        self.words.first().map_or("", String::as_str)
    }

    /// Finalize into wire words, appending the correlation tag.
    pub(crate) fn into_words(mut self, tag: u32) -> Vec<String> {
        self.words.push(format!(".tag={tag}"));
        self.words
    }
}

// ── Reply ────────────────────────────────────────────────────────────

/// The kind marker leading a reply sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `!done` — the exchange completed.
    Done,
    /// `!re` — one data row; zero or more precede the terminal reply.
    Row,
    /// `!trap` — the command failed; the session stays usable.
    Trap,
    /// `!fatal` — the session is being terminated by the device.
    Fatal,
}

/// One parsed reply sentence.
#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: ReplyKind,
    /// Correlation tag echoed from the request, if present and numeric.
    pub tag: Option<u32>,
    pub attrs: RowMap,
}

impl Reply {
    /// Parse a decoded word list into a reply.
    ///
    /// A sentence without a `!` kind word (or with an unknown one) is not
    /// a valid reply; the stream that produced it cannot be trusted.
    pub fn parse(words: &[String]) -> Result<Self, Error> {
        let mut kind = None;
        let mut tag = None;
        let mut attrs = RowMap::new();

        for word in words {
            if let Some(marker) = word.strip_prefix('!') {
                kind = Some(match marker {
                    "done" => ReplyKind::Done,
                    "re" => ReplyKind::Row,
                    "trap" => ReplyKind::Trap,
                    "fatal" => ReplyKind::Fatal,
                    other => {
                        return Err(Error::Decode {
                            reason: format!("unknown reply kind !{other}"),
                        });
                    }
                });
            } else if let Some(value) = word.strip_prefix(".tag=") {
                tag = value.parse().ok();
            } else if let Some(pair) = word.strip_prefix('=') {
                match pair.split_once('=') {
                    Some((key, value)) => attrs.insert(key.to_string(), value.to_string()),
                    None => attrs.insert(pair.to_string(), String::new()),
                };
            } else {
                // bare word (e.g. a !fatal reason) -- keep it as a key
                attrs.insert(word.clone(), String::new());
            }
        }

        let kind = kind.ok_or_else(|| Error::Decode {
            reason: "reply sentence has no kind word".to_string(),
        })?;

        Ok(Self { kind, tag, attrs })
    }

    /// The device's human-readable message, if it sent one.
    pub fn message(&self) -> Option<&str> {
        self.attrs.get("message").map(String::as_str)
    }

    /// The numeric error category on `!trap` replies.
    pub fn category(&self) -> Option<&str> {
        self.attrs.get("category").map(String::as_str)
    }

    /// Whether this reply ends its exchange (`!done` or `!fatal`).
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.kind, ReplyKind::Done | ReplyKind::Fatal)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
