#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use signup_contracts::mirror::{CommitLabel, MirrorTarget};
use signup_contracts::ContractViolation;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const MIRROR_API_BASE_DEFAULT: &str = "https://api.github.com";
pub const MIRROR_API_VERSION: &str = "2022-11-28";
pub const MIRROR_USER_AGENT: &str = concat!("signup-mirror/", env!("CARGO_PKG_VERSION"));
pub const MIRROR_RETRY_AFTER_MS_DEFAULT: u32 = 30_000;
pub const MIRROR_RETRY_AFTER_MS_MIN: u32 = 1_000;
pub const MIRROR_RETRY_AFTER_MS_MAX: u32 = 300_000;
/// Re-fetch-and-retry rounds after the remote reports a stale revision.
pub const MIRROR_STALE_REVISION_RETRIES: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorPushError {
    #[error("remote revision changed during update (http {status})")]
    StaleRevision { status: u16 },
    #[error("remote rejected credentials (http {status})")]
    Unauthorized { status: u16 },
    #[error("remote rejected request (http {status})")]
    Rejected { status: u16 },
    #[error("remote unavailable (http {status})")]
    Unavailable {
        status: u16,
        retry_after_ms: Option<u32>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid mirror request: {0}")]
    InvalidRequest(String),
}

impl MirrorPushError {
    /// Errors that will not go away by retrying the same request.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::Rejected { .. } | Self::InvalidRequest(_)
        )
    }

    pub fn retry_after_ms(&self) -> u32 {
        let raw = match self {
            Self::Unavailable {
                retry_after_ms: Some(ms),
                ..
            } => *ms,
            Self::StaleRevision { .. } => MIRROR_RETRY_AFTER_MS_MIN,
            _ => MIRROR_RETRY_AFTER_MS_DEFAULT,
        };
        raw.clamp(MIRROR_RETRY_AFTER_MS_MIN, MIRROR_RETRY_AFTER_MS_MAX)
    }

    fn from_status(status: u16, retry_after: Option<&str>) -> Self {
        match status {
            409 | 422 => Self::StaleRevision { status },
            401 => Self::Unauthorized { status },
            403 if retry_after.is_none() => Self::Unauthorized { status },
            403 | 408 | 429 | 500..=599 => Self::Unavailable {
                status,
                retry_after_ms: retry_after.map(parse_retry_after_ms),
            },
            _ => Self::Rejected { status },
        }
    }
}

/// Connection settings for the remote contents API.
#[derive(Clone, PartialEq, Eq)]
pub struct MirrorContentsConfig {
    pub api_base: Url,
    pub target: MirrorTarget,
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl fmt::Debug for MirrorContentsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorContentsConfig")
            .field("api_base", &self.api_base.as_str())
            .field("target", &self.target)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl MirrorContentsConfig {
    /// Reads `SIGNUP_MIRROR_*` through `lookup`. `Ok(None)` when no mirror
    /// target is configured.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ContractViolation>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let owner = non_empty("SIGNUP_MIRROR_OWNER");
        let repo = non_empty("SIGNUP_MIRROR_REPO");
        let path = non_empty("SIGNUP_MIRROR_PATH");
        let (owner, repo, path) = match (owner, repo, path) {
            (None, None, None) => return Ok(None),
            (Some(owner), Some(repo), Some(path)) => (owner, repo, path),
            _ => {
                return Err(ContractViolation::InvalidValue {
                    field: "mirror_target",
                    reason: "SIGNUP_MIRROR_OWNER, SIGNUP_MIRROR_REPO and SIGNUP_MIRROR_PATH must be set together",
                })
            }
        };
        let target = MirrorTarget::v1(owner, repo, path, non_empty("SIGNUP_MIRROR_BRANCH"))?;
        let api_base_raw =
            non_empty("SIGNUP_MIRROR_API_BASE").unwrap_or_else(|| MIRROR_API_BASE_DEFAULT.to_string());
        let api_base = Url::parse(&api_base_raw)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && !u.cannot_be_a_base())
            .ok_or(ContractViolation::InvalidValue {
                field: "mirror_api_base",
                reason: "must be an absolute http(s) URL",
            })?;
        let connect_timeout_ms = non_empty("SIGNUP_MIRROR_CONNECT_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(3_000);
        let request_timeout_ms = non_empty("SIGNUP_MIRROR_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(15_000);

        Ok(Some(Self {
            api_base,
            target,
            token: non_empty("SIGNUP_MIRROR_TOKEN"),
            connect_timeout_ms,
            request_timeout_ms,
        }))
    }

    /// Upper bound on one [`push_with_retry`] call: every stale-revision round
    /// is a GET plus a PUT, and each request may spend the connect timeout
    /// plus the write and read timeouts.
    pub fn worst_case_push_ms(&self) -> u64 {
        let rounds = u64::from(MIRROR_STALE_REVISION_RETRIES) + 1;
        let per_request = self
            .connect_timeout_ms
            .saturating_add(self.request_timeout_ms.saturating_mul(2));
        rounds.saturating_mul(2).saturating_mul(per_request)
    }

    /// `{api_base}/repos/{owner}/{repo}/contents/{path...}`, each part percent-encoded.
    pub fn contents_url(&self) -> Result<Url, MirrorPushError> {
        let mut url = self.api_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                MirrorPushError::InvalidRequest("api base cannot carry a path".to_string())
            })?;
            segments
                .pop_if_empty()
                .extend(["repos", self.target.owner.as_str(), self.target.repo.as_str(), "contents"])
                .extend(self.target.path_segments());
        }
        url.set_query(None);
        Ok(url)
    }

    pub fn revision_url(&self) -> Result<Url, MirrorPushError> {
        let mut url = self.contents_url()?;
        if let Some(branch) = self.target.branch.as_deref() {
            url.query_pairs_mut().append_pair("ref", branch);
        }
        Ok(url)
    }
}

/// Body of a contents update. The label is a plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentsPutRequest {
    pub message: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl ContentsPutRequest {
    pub fn v1(
        csv_bytes: &[u8],
        label: &CommitLabel,
        prior_revision: Option<String>,
        branch: Option<String>,
    ) -> Self {
        Self {
            message: label.as_str().to_string(),
            content: BASE64.encode(csv_bytes),
            sha: prior_revision,
            branch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorPutReceipt {
    pub revision: Option<String>,
}

/// Remote contents surface, split so the retry logic can run against a fake.
pub trait MirrorTransport {
    /// Current revision hash of the mirrored object, `None` when it does not exist.
    fn fetch_revision(&self) -> Result<Option<String>, MirrorPushError>;

    fn put_content(&self, request: &ContentsPutRequest) -> Result<MirrorPutReceipt, MirrorPushError>;
}

/// Fetches the current revision, then writes `csv_bytes` over it. A stale
/// revision answer triggers a fresh fetch and another write, a bounded number
/// of times.
pub fn push_with_retry<T: MirrorTransport + ?Sized>(
    transport: &T,
    csv_bytes: &[u8],
    label: &CommitLabel,
    branch: Option<&str>,
) -> Result<MirrorPutReceipt, MirrorPushError> {
    let mut stale_rounds = 0u8;
    loop {
        let prior = transport.fetch_revision()?;
        let request =
            ContentsPutRequest::v1(csv_bytes, label, prior, branch.map(ToString::to_string));
        match transport.put_content(&request) {
            Ok(receipt) => return Ok(receipt),
            Err(MirrorPushError::StaleRevision { status })
                if stale_rounds < MIRROR_STALE_REVISION_RETRIES =>
            {
                stale_rounds += 1;
                debug!(status, stale_rounds, "mirror revision stale, refetching");
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentsMetadata {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentsPutResponse {
    content: Option<ContentsMetadata>,
}

/// `MirrorTransport` over HTTPS with bearer auth.
#[derive(Debug)]
pub struct HttpMirrorTransport {
    config: MirrorContentsConfig,
    agent: ureq::Agent,
}

impl HttpMirrorTransport {
    pub fn new(config: MirrorContentsConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .user_agent(MIRROR_USER_AGENT)
            .build();
        Self { config, agent }
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut req = self
            .agent
            .request_url(method, url)
            .set("accept", "application/vnd.github+json")
            .set("x-github-api-version", MIRROR_API_VERSION);
        if let Some(token) = self.config.token.as_deref() {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        req
    }
}

impl MirrorTransport for HttpMirrorTransport {
    fn fetch_revision(&self) -> Result<Option<String>, MirrorPushError> {
        let url = self.config.revision_url()?;
        match self.request("GET", &url).call() {
            Ok(resp) => {
                let meta: ContentsMetadata = resp
                    .into_json()
                    .map_err(|err| MirrorPushError::Transport(format!("revision decode: {err}")))?;
                Ok(Some(meta.sha))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(push_error_from_ureq(err)),
        }
    }

    fn put_content(&self, request: &ContentsPutRequest) -> Result<MirrorPutReceipt, MirrorPushError> {
        let url = self.config.contents_url()?;
        match self.request("PUT", &url).send_json(request) {
            Ok(resp) => {
                let revision = resp
                    .into_json::<ContentsPutResponse>()
                    .ok()
                    .and_then(|body| body.content)
                    .map(|meta| meta.sha);
                Ok(MirrorPutReceipt { revision })
            }
            Err(err) => Err(push_error_from_ureq(err)),
        }
    }
}

fn push_error_from_ureq(err: ureq::Error) -> MirrorPushError {
    match err {
        ureq::Error::Status(status, resp) => {
            MirrorPushError::from_status(status, resp.header("retry-after"))
        }
        ureq::Error::Transport(transport) => {
            MirrorPushError::Transport(format!("{:?}: {}", transport.kind(), transport))
        }
    }
}

/// `Retry-After` in whole seconds, bounded; anything else falls back to the default.
pub fn parse_retry_after_ms(header: &str) -> u32 {
    header
        .trim()
        .parse::<u32>()
        .ok()
        .map(|s| s.saturating_mul(1_000))
        .filter(|ms| (MIRROR_RETRY_AFTER_MS_MIN..=MIRROR_RETRY_AFTER_MS_MAX).contains(ms))
        .unwrap_or(MIRROR_RETRY_AFTER_MS_DEFAULT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};

    #[derive(Default)]
    struct ScriptedTransport {
        revisions: RefCell<VecDeque<Result<Option<String>, MirrorPushError>>>,
        puts: RefCell<VecDeque<Result<MirrorPutReceipt, MirrorPushError>>>,
        sent: RefCell<Vec<ContentsPutRequest>>,
    }

    impl ScriptedTransport {
        fn revision(self, r: Result<Option<&str>, MirrorPushError>) -> Self {
            self.revisions
                .borrow_mut()
                .push_back(r.map(|o| o.map(str::to_string)));
            self
        }

        fn put(self, r: Result<MirrorPutReceipt, MirrorPushError>) -> Self {
            self.puts.borrow_mut().push_back(r);
            self
        }
    }

    impl MirrorTransport for ScriptedTransport {
        fn fetch_revision(&self) -> Result<Option<String>, MirrorPushError> {
            self.revisions
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        fn put_content(
            &self,
            request: &ContentsPutRequest,
        ) -> Result<MirrorPutReceipt, MirrorPushError> {
            self.sent.borrow_mut().push(request.clone());
            self.puts
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(MirrorPutReceipt::default()))
        }
    }

    fn label() -> CommitLabel {
        CommitLabel::new("新增報名 001 (Tom)").unwrap()
    }

    fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn at_mirror_client_01_first_push_without_prior_revision() {
        let t = ScriptedTransport::default().revision(Ok(None)).put(Ok(MirrorPutReceipt {
            revision: Some("abc".to_string()),
        }));
        let receipt = push_with_retry(&t, b"csv", &label(), Some("main")).unwrap();
        assert_eq!(receipt.revision.as_deref(), Some("abc"));
        let sent = t.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sha, None);
        assert_eq!(sent[0].branch.as_deref(), Some("main"));
        assert_eq!(sent[0].content, BASE64.encode(b"csv"));
        assert_eq!(sent[0].message, "新增報名 001 (Tom)");
    }

    #[test]
    fn at_mirror_client_02_stale_revision_refetches_and_retries() {
        let t = ScriptedTransport::default()
            .revision(Ok(Some("old")))
            .put(Err(MirrorPushError::StaleRevision { status: 409 }))
            .revision(Ok(Some("new")))
            .put(Ok(MirrorPutReceipt::default()));
        push_with_retry(&t, b"csv", &label(), None).unwrap();
        let sent = t.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].sha.as_deref(), Some("old"));
        assert_eq!(sent[1].sha.as_deref(), Some("new"));
    }

    #[test]
    fn at_mirror_client_03_stale_revision_retries_are_bounded() {
        let mut t = ScriptedTransport::default();
        for _ in 0..=MIRROR_STALE_REVISION_RETRIES {
            t = t
                .revision(Ok(Some("x")))
                .put(Err(MirrorPushError::StaleRevision { status: 422 }));
        }
        let err = push_with_retry(&t, b"csv", &label(), None).unwrap_err();
        assert_eq!(err, MirrorPushError::StaleRevision { status: 422 });
        assert_eq!(t.sent.borrow().len(), MIRROR_STALE_REVISION_RETRIES as usize + 1);
        assert!(!err.is_permanent());
    }

    #[test]
    fn at_mirror_client_04_other_failures_surface_without_retry() {
        let t = ScriptedTransport::default()
            .revision(Ok(Some("x")))
            .put(Err(MirrorPushError::Unauthorized { status: 401 }));
        let err = push_with_retry(&t, b"csv", &label(), None).unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(t.sent.borrow().len(), 1);

        let t = ScriptedTransport::default()
            .revision(Err(MirrorPushError::Transport("timed out".to_string())));
        let err = push_with_retry(&t, b"csv", &label(), None).unwrap_err();
        assert!(!err.is_permanent());
        assert!(t.sent.borrow().is_empty());
    }

    #[test]
    fn at_mirror_client_05_status_classification() {
        assert_eq!(
            MirrorPushError::from_status(409, None),
            MirrorPushError::StaleRevision { status: 409 }
        );
        assert!(MirrorPushError::from_status(404, None).is_permanent());
        assert!(MirrorPushError::from_status(403, None).is_permanent());
        let limited = MirrorPushError::from_status(403, Some("60"));
        assert!(!limited.is_permanent());
        assert_eq!(limited.retry_after_ms(), 60_000);
        assert_eq!(
            MirrorPushError::from_status(503, Some("soon")).retry_after_ms(),
            MIRROR_RETRY_AFTER_MS_DEFAULT
        );
        assert_eq!(
            MirrorPushError::from_status(429, Some("9999")).retry_after_ms(),
            MIRROR_RETRY_AFTER_MS_DEFAULT
        );
    }

    #[test]
    fn at_mirror_client_06_config_from_lookup() {
        let none = MirrorContentsConfig::from_lookup(|_| None).unwrap();
        assert!(none.is_none());

        let partial = env_map(&[("SIGNUP_MIRROR_OWNER", "acme")]);
        assert!(MirrorContentsConfig::from_lookup(|k| partial.get(k).cloned()).is_err());

        let vars = env_map(&[
            ("SIGNUP_MIRROR_OWNER", "acme"),
            ("SIGNUP_MIRROR_REPO", "signup"),
            ("SIGNUP_MIRROR_PATH", "data/報名 名單.csv"),
            ("SIGNUP_MIRROR_BRANCH", "main"),
            ("SIGNUP_MIRROR_TOKEN", "ghp_secret"),
            ("SIGNUP_MIRROR_CONNECT_TIMEOUT_MS", "5"),
        ]);
        let cfg = MirrorContentsConfig::from_lookup(|k| vars.get(k).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(cfg.connect_timeout_ms, 3_000);
        assert_eq!(cfg.request_timeout_ms, 15_000);
        assert_eq!(
            cfg.revision_url().unwrap().as_str(),
            "https://api.github.com/repos/acme/signup/contents/data/%E5%A0%B1%E5%90%8D%20%E5%90%8D%E5%96%AE.csv?ref=main"
        );
        assert!(!format!("{cfg:?}").contains("ghp_secret"));
        // four rounds of GET + PUT, each request up to connect + write + read
        assert_eq!(cfg.worst_case_push_ms(), 264_000);
    }

    #[test]
    fn at_mirror_client_07_api_base_with_path_prefix() {
        let vars = env_map(&[
            ("SIGNUP_MIRROR_OWNER", "acme"),
            ("SIGNUP_MIRROR_REPO", "signup"),
            ("SIGNUP_MIRROR_PATH", "signup_data.csv"),
            ("SIGNUP_MIRROR_API_BASE", "https://ghe.example.com/api/v3/"),
        ]);
        let cfg = MirrorContentsConfig::from_lookup(|k| vars.get(k).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(
            cfg.contents_url().unwrap().as_str(),
            "https://ghe.example.com/api/v3/repos/acme/signup/contents/signup_data.csv"
        );
        assert_eq!(cfg.revision_url().unwrap(), cfg.contents_url().unwrap());
    }
}
