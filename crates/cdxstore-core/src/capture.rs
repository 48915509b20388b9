//! The capture record and its CDX text representation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::surt::surt_canonicalize;

/// Number of space-delimited fields in an ingestable CDX line.
///
/// Field order: `urlkey ? timestamp original mimetype status digest
/// redirecturl ? length compressedoffset file`. The two `?` columns are
/// carried by the format but not by the index; they are written back as `-`.
pub const CDX_FIELD_COUNT: usize = 12;

const MAX_TIMESTAMP: u64 = 99_999_999_999_999;

/// One archived-response record.
///
/// `(urlkey, timestamp, file, compressed_offset)` identifies a capture;
/// everything else is payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub urlkey: String,
    /// Packed decimal `YYYYMMDDhhmmss`.
    pub timestamp: u64,
    pub original: String,
    pub mimetype: String,
    /// HTTP status, 0 when absent.
    pub status: u32,
    pub digest: String,
    /// `-` when the capture was not a redirect.
    pub redirecturl: String,
    /// Record length in the source WARC/ARC.
    pub length: u64,
    pub compressed_offset: u64,
    /// Source archive filename.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {CDX_FIELD_COUNT} fields, found {found}")]
    FieldCount { found: usize },
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("timestamp out of range: {0}")]
    TimestampRange(u64),
    #[error("@alias expects a source and a target URL, found {found} tokens")]
    AliasArity { found: usize },
}

fn numeric(field: &'static str, value: &str) -> Result<u64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

impl Capture {
    /// Parse one space-delimited CDX record.
    ///
    /// A `-` urlkey is derived by canonicalizing the original URL. A `-`
    /// status decodes as 0, and a `-` length as 0.
    pub fn from_cdx_line(line: &str) -> Result<Capture, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != CDX_FIELD_COUNT {
            return Err(ParseError::FieldCount {
                found: fields.len(),
            });
        }

        let timestamp = numeric("timestamp", fields[2])?;
        if timestamp > MAX_TIMESTAMP {
            return Err(ParseError::TimestampRange(timestamp));
        }
        let original = fields[3].to_string();
        let urlkey = match fields[0] {
            "" | "-" => surt_canonicalize(&original),
            key => key.to_string(),
        };
        let status = match fields[5] {
            "-" => 0,
            s => numeric("status", s)? as u32,
        };
        let length = match fields[9] {
            "-" => 0,
            s => numeric("length", s)?,
        };

        Ok(Capture {
            urlkey,
            timestamp,
            original,
            mimetype: fields[4].to_string(),
            status,
            digest: fields[6].to_string(),
            redirecturl: fields[7].to_string(),
            length,
            compressed_offset: numeric("compressedoffset", fields[10])?,
            file: fields[11].to_string(),
        })
    }

    /// Format the record back into its CDX line.
    pub fn to_cdx_line(&self) -> String {
        let status = if self.status == 0 {
            "-".to_string()
        } else {
            self.status.to_string()
        };
        let redirect = if self.redirecturl.is_empty() {
            "-"
        } else {
            &self.redirecturl
        };
        format!(
            "{} - {:014} {} {} {} {} {} - {} {} {}",
            self.urlkey,
            self.timestamp,
            self.original,
            self.mimetype,
            status,
            self.digest,
            redirect,
            self.length,
            self.compressed_offset,
            self.file
        )
    }

    /// Calendar date of the capture, if the packed timestamp is a real date.
    pub fn date(&self) -> Option<OffsetDateTime> {
        let ts = self.timestamp;
        let year = (ts / 10_000_000_000) as i32;
        let month = Month::try_from(((ts / 100_000_000) % 100) as u8).ok()?;
        let day = ((ts / 1_000_000) % 100) as u8;
        let hour = ((ts / 10_000) % 100) as u8;
        let minute = ((ts / 100) % 100) as u8;
        let second = (ts % 100) as u8;
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms(hour, minute, second).ok()?;
        Some(PrimitiveDateTime::new(date, time).assume_utc())
    }
}

impl fmt::Display for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cdx_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str =
        "- - 20200101000000 http://example.org/ text/html 200 sha1:AAA - - 1234 5678 file.warc.gz";

    #[test]
    fn parses_a_capture_line() {
        let capture = Capture::from_cdx_line(LINE).unwrap();
        assert_eq!(capture.urlkey, "org,example)/");
        assert_eq!(capture.timestamp, 20200101000000);
        assert_eq!(capture.original, "http://example.org/");
        assert_eq!(capture.mimetype, "text/html");
        assert_eq!(capture.status, 200);
        assert_eq!(capture.digest, "sha1:AAA");
        assert_eq!(capture.redirecturl, "-");
        assert_eq!(capture.length, 1234);
        assert_eq!(capture.compressed_offset, 5678);
        assert_eq!(capture.file, "file.warc.gz");
    }

    #[test]
    fn formats_back_to_the_same_line() {
        let capture = Capture::from_cdx_line(LINE).unwrap();
        let expected = LINE.replacen('-', "org,example)/", 1);
        assert_eq!(capture.to_cdx_line(), expected);
    }

    #[test]
    fn provided_urlkey_is_kept() {
        let line = LINE.replacen('-', "org,example)/custom", 1);
        let capture = Capture::from_cdx_line(&line).unwrap();
        assert_eq!(capture.urlkey, "org,example)/custom");
    }

    #[test]
    fn dash_status_decodes_as_zero() {
        let line = LINE.replace(" 200 ", " - ");
        let capture = Capture::from_cdx_line(&line).unwrap();
        assert_eq!(capture.status, 0);
        assert!(capture.to_cdx_line().contains(" - sha1:AAA "));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let err = Capture::from_cdx_line("a b c d e").unwrap_err();
        assert_eq!(err, ParseError::FieldCount { found: 5 });
        assert!(Capture::from_cdx_line(&format!("{LINE} extra")).is_err());
    }

    #[test]
    fn non_numeric_offset_is_rejected() {
        let line = LINE.replace("5678", "notanumber");
        assert!(matches!(
            Capture::from_cdx_line(&line),
            Err(ParseError::InvalidNumber { field: "compressedoffset", .. })
        ));
    }

    #[test]
    fn capture_date_is_decoded() {
        let capture = Capture::from_cdx_line(LINE).unwrap();
        let date = capture.date().unwrap();
        assert_eq!(date.year(), 2020);
        assert_eq!(date.month(), Month::January);
        assert_eq!(date.day(), 1);
    }

    #[test]
    fn nonsense_timestamp_has_no_date() {
        let mut capture = Capture::from_cdx_line(LINE).unwrap();
        capture.timestamp = 20201399000000;
        assert!(capture.date().is_none());
    }
}
