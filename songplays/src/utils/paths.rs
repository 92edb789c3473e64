use common::{Error, Result};

/// Directory value used for a null partition key.
pub const DEFAULT_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

fn needs_escape(c: char) -> bool {
    matches!(
        c,
        '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '}' | '[' | ']'
            | '^' | '<' | '>' | '|' | '`' | '~' | '\u{7f}'
    ) || c.is_ascii_control()
}

/// Percent-escapes characters that cannot appear inside a `column=value`
/// directory name.
pub fn escape_partition_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Builds the location of a data file relative to its dataset directory.
#[derive(Debug, Clone, Default)]
pub struct PathBuilder {
    partitions: Vec<(String, Option<String>)>,
}

impl PathBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(mut self, column: &str, value: Option<&str>) -> Self {
        self.partitions
            .push((column.to_string(), value.map(str::to_string)));
        self
    }

    /// `column=value/column=value`, empty for an unpartitioned dataset.
    pub fn build_partition_path(&self) -> String {
        self.partitions
            .iter()
            .map(|(column, value)| {
                let value = match value {
                    Some(v) if !v.is_empty() => escape_partition_value(v),
                    _ => DEFAULT_PARTITION_VALUE.to_string(),
                };
                format!("{}={}", column, value)
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn build_file_path(&self, filename: &str) -> String {
        let partition_path = self.build_partition_path();
        if partition_path.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", partition_path, filename)
        }
    }
}

/// Splits `s3://bucket/prefix` into bucket and prefix.
pub fn split_s3_url(url: &url::Url) -> Result<(String, String)> {
    if url.scheme() != "s3" {
        return Err(Error::InvalidUri(format!(
            "'{}' is not an S3 url (expected scheme 's3')",
            url
        )));
    }
    let bucket = url
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| Error::InvalidUri(format!("'{}' has no bucket", url)))?;
    Ok((
        bucket.to_string(),
        url.path().trim_matches('/').to_string(),
    ))
}
