//! Mount specifications, the opaque keyvalue bags the daemon hands to a
//! backend at mount time.

use std::{collections::HashMap, path::PathBuf};

use percent_encoding::percent_decode_str;

use crate::{
    codec::{FilterCode, FormatCode},
    error::{Error, Result},
};

/// Recognized keys for archive mounts: `host` (URI-escaped path) or `file`
/// (raw path), plus `create`, `format` and `filters` for creating a new
/// archive in place.
#[derive(Debug, Clone, Default)]
pub struct MountSpec {
    values: HashMap<String, String>,
}

impl MountSpec {
    pub fn new() -> Self {
        MountSpec::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

pub(crate) struct MountOptions {
    pub path: PathBuf,
    pub create: Option<CreateOptions>,
}

pub(crate) struct CreateOptions {
    pub format: FormatCode,
    pub filters: Vec<FilterCode>,
}

pub(crate) fn parse(spec: &MountSpec) -> Result<MountOptions> {
    let path = match (spec.get("host"), spec.get("file")) {
        (Some(host), _) => {
            let decoded = percent_decode_str(host)
                .decode_utf8()
                .map_err(|_| Error::invalid_argument("Invalid mount spec"))?;
            PathBuf::from(decoded.into_owned())
        }
        (None, Some(file)) => PathBuf::from(file),
        (None, None) => return Err(Error::invalid_argument("No hostname specified")),
    };

    let create = match spec.get("create") {
        None => None,
        Some(_) => {
            let format = spec
                .get("format")
                .ok_or_else(|| Error::invalid_argument("No format specified"))?;
            let format = format
                .parse::<FormatCode>()
                .map_err(|_| Error::invalid_argument("Invalid format"))?;

            let filters = match spec.get("filters") {
                None | Some("") => Vec::new(),
                Some(filters) => filters
                    .split(',')
                    .map(|code| {
                        code.parse::<FilterCode>()
                            .map_err(|_| Error::invalid_argument("Invalid filter"))
                    })
                    .collect::<Result<Vec<_>>>()?,
            };

            Some(CreateOptions { format, filters })
        }
    };

    Ok(MountOptions { path, create })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_is_percent_decoded() {
        let spec = MountSpec::new().with("host", "%2Ftmp%2Fsome%20archive.tar");
        let options = parse(&spec).unwrap();

        assert_eq!(options.path, PathBuf::from("/tmp/some archive.tar"));
        assert!(options.create.is_none());
    }

    #[test]
    fn file_is_taken_verbatim() {
        let spec = MountSpec::new().with("file", "/tmp/a.tar");

        assert_eq!(parse(&spec).unwrap().path, PathBuf::from("/tmp/a.tar"));
    }

    #[test]
    fn missing_location_is_rejected() {
        assert!(matches!(
            parse(&MountSpec::new()),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn create_requires_a_format() {
        let spec = MountSpec::new().with("file", "/tmp/a.tar").with("create", "1");

        assert!(matches!(
            parse(&spec),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn create_parses_format_and_filters() {
        let spec = MountSpec::new()
            .with("file", "/tmp/a.tar")
            .with("create", "1")
            .with("format", "77")
            .with("filters", "3,1");

        let create = parse(&spec).unwrap().create.unwrap();
        assert_eq!(create.format, 77);
        assert_eq!(create.filters, vec![3, 1]);
    }

    #[test]
    fn malformed_filters_are_rejected() {
        let spec = MountSpec::new()
            .with("file", "/tmp/a.tar")
            .with("create", "1")
            .with("format", "77")
            .with("filters", "3;1");

        assert!(matches!(parse(&spec), Err(Error::InvalidArgument { .. })));
    }
}
