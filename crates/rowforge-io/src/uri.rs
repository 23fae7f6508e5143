//! URI handling: `file:///abs/path`, bare paths and `memory://bucket/key`.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Memory,
}

/// A parsed storage location: the backend plus the key that backend uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub scheme: Scheme,
    pub path: String,
}

fn malformed(uri: &str, reason: impl Into<String>) -> Error {
    Error::Uri {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

impl Location {
    pub fn parse(uri: &str) -> Result<Location> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(malformed(uri, "empty"));
        }
        if !uri.contains("://") {
            return Ok(Location {
                scheme: Scheme::File,
                path: uri.to_string(),
            });
        }
        let url = Url::parse(uri).map_err(|e| malformed(uri, e.to_string()))?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| malformed(uri, "not a local file path"))?;
                Ok(Location {
                    scheme: Scheme::File,
                    path: path.to_string_lossy().into_owned(),
                })
            }
            "memory" => {
                let host = url.host_str().unwrap_or_default();
                let path = format!("{host}{}", url.path());
                let path = path.trim_end_matches('/').to_string();
                if path.is_empty() {
                    return Err(malformed(uri, "missing bucket"));
                }
                Ok(Location {
                    scheme: Scheme::Memory,
                    path,
                })
            }
            other => Err(malformed(uri, format!("unsupported scheme '{other}'"))),
        }
    }

    pub fn join(&self, name: &str) -> Location {
        Location {
            scheme: self.scheme,
            path: format!("{}/{}", self.path.trim_end_matches('/'), name),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::File => f.write_str(&self.path),
            Scheme::Memory => write!(f, "memory://{}", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        let bare = Location::parse("data/in.csv").unwrap();
        assert_eq!(bare.scheme, Scheme::File);
        assert_eq!(bare.path, "data/in.csv");

        let mem = Location::parse("memory://bucket/dir/a.csv").unwrap();
        assert_eq!(mem.scheme, Scheme::Memory);
        assert_eq!(mem.path, "bucket/dir/a.csv");
        assert_eq!(mem.to_string(), "memory://bucket/dir/a.csv");

        #[cfg(unix)]
        {
            let file = Location::parse("file:///tmp/x.csv").unwrap();
            assert_eq!(file.path, "/tmp/x.csv");
        }
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!(Location::parse(""), Err(Error::Uri { .. })));
        assert!(matches!(Location::parse("s3://bucket/key"), Err(Error::Uri { .. })));
        assert!(matches!(Location::parse("memory://"), Err(Error::Uri { .. })));
    }

    #[test]
    fn join_appends_a_segment() {
        let base = Location::parse("memory://scratch/job/").unwrap();
        assert_eq!(base.join("part-00000.csv").to_string(), "memory://scratch/job/part-00000.csv");
    }
}
