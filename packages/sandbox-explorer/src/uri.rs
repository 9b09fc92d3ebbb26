use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use sandbox_explorer_error::SandboxError;

use crate::paths;

/// Characters escaped in the path part. `%` is included so literal escapes survive
/// a round trip.
const PATH_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// `scheme://sandboxId/path`, the form the editor's virtual filesystem uses to
/// address files inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxUri {
    pub scheme: String,
    pub sandbox_id: String,
    pub path: String,
}

impl SandboxUri {
    pub fn new(scheme: &str, sandbox_id: &str, path: &str) -> Self {
        let path = if path.is_empty() {
            paths::ROOT.to_string()
        } else {
            paths::normalize(path)
        };
        Self {
            scheme: scheme.to_string(),
            sandbox_id: sandbox_id.to_string(),
            path,
        }
    }

    pub fn parse(input: &str, expected_scheme: &str) -> Result<Self, SandboxError> {
        let url = Url::parse(input).map_err(|err| SandboxError::InvalidRequest {
            message: format!("invalid sandbox uri {input}: {err}"),
        })?;
        if url.scheme() != expected_scheme {
            return Err(SandboxError::InvalidRequest {
                message: format!(
                    "unexpected uri scheme {}, expected {expected_scheme}",
                    url.scheme()
                ),
            });
        }
        let sandbox_id = url.host_str().unwrap_or_default();
        if sandbox_id.is_empty() {
            return Err(SandboxError::invalid(format!(
                "sandbox uri {input} has no sandbox id"
            )));
        }
        let path = percent_decode_str(url.path()).decode_utf8_lossy();
        Ok(Self::new(expected_scheme, sandbox_id, &path))
    }
}

impl fmt::Display for SandboxUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme,
            self.sandbox_id,
            utf8_percent_encode(&self.path, PATH_ESCAPES)
        )
    }
}
