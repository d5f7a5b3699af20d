//! The transferred unit and its wire encoding.
//!
//! Layout of an encoded bundle (version 1):
//!
//! ```text
//! "RMB" | version: u8 | 5 x (tag: u8 | len: u32 BE | len bytes)
//! ```
//!
//! Fields always appear in the order document, document name, full name,
//! organization, phone. Strings are UTF-8.

use std::path::Path;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::errors::{RegError, Result};

pub const BUNDLE_MAGIC: &[u8; 3] = b"RMB";
pub const BUNDLE_VERSION: u8 = 1;

const TAG_DOCUMENT: u8 = 0x01;
const TAG_DOCUMENT_NAME: u8 = 0x02;
const TAG_FULL_NAME: u8 = 0x03;
const TAG_ORGANIZATION: u8 = 0x04;
const TAG_PHONE: u8 = 0x05;

const HEADER_LEN: usize = BUNDLE_MAGIC.len() + 1;
const FIELD_HEADER_LEN: usize = 1 + 4;

/// Contact details typed in by the submitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterInfo {
    pub full_name: String,
    pub organization: String,
    pub phone: String,
}

impl SubmitterInfo {
    pub fn new(
        full_name: impl Into<String>,
        organization: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            organization: organization.into(),
            phone: phone.into(),
        }
    }
}

/// An identity document together with the details of who submitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    document_bytes: Vec<u8>,
    document_name: String,
    submitter: SubmitterInfo,
}

impl Bundle {
    pub fn new(
        document_bytes: Vec<u8>,
        document_name: impl Into<String>,
        submitter: SubmitterInfo,
    ) -> Self {
        Self {
            document_bytes,
            document_name: document_name.into(),
            submitter,
        }
    }

    /// Reads the chosen document from disk. Only the final path component
    /// is kept as the document name.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        submitter: SubmitterInfo,
    ) -> Result<Self> {
        let path = path.as_ref();
        let document_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                RegError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} does not name a file", path.display()),
                ))
            })?;
        let document_bytes = std::fs::read(path)?;
        Ok(Self::new(document_bytes, document_name, submitter))
    }

    pub fn document_bytes(&self) -> &[u8] {
        &self.document_bytes
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn submitter(&self) -> &SubmitterInfo {
        &self.submitter
    }

    pub fn into_parts(self) -> (Vec<u8>, String, SubmitterInfo) {
        (self.document_bytes, self.document_name, self.submitter)
    }

    /// Exact length of [`encode`]'s output for this bundle.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + 5 * FIELD_HEADER_LEN
            + self.document_bytes.len()
            + self.document_name.len()
            + self.submitter.full_name.len()
            + self.submitter.organization.len()
            + self.submitter.phone.len()
    }
}

pub fn encode(bundle: &Bundle) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bundle.encoded_len());
    out.extend_from_slice(BUNDLE_MAGIC);
    out.push(BUNDLE_VERSION);

    put_field(&mut out, TAG_DOCUMENT, &bundle.document_bytes)?;
    put_field(&mut out, TAG_DOCUMENT_NAME, bundle.document_name.as_bytes())?;
    put_field(
        &mut out,
        TAG_FULL_NAME,
        bundle.submitter.full_name.as_bytes(),
    )?;
    put_field(
        &mut out,
        TAG_ORGANIZATION,
        bundle.submitter.organization.as_bytes(),
    )?;
    put_field(&mut out, TAG_PHONE, bundle.submitter.phone.as_bytes())?;

    trace!("encoded bundle into {} bytes", out.len());
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Bundle> {
    if bytes.len() < HEADER_LEN {
        return Err(malformed("shorter than the bundle header"));
    }
    if &bytes[..BUNDLE_MAGIC.len()] != BUNDLE_MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = bytes[BUNDLE_MAGIC.len()];
    if version != BUNDLE_VERSION {
        return Err(malformed(&format!("unsupported version {version}")));
    }

    let mut reader = FieldReader {
        bytes,
        pos: HEADER_LEN,
    };
    let document_bytes = reader.field(TAG_DOCUMENT)?.to_vec();
    let document_name = reader.string(TAG_DOCUMENT_NAME)?;
    let full_name = reader.string(TAG_FULL_NAME)?;
    let organization = reader.string(TAG_ORGANIZATION)?;
    let phone = reader.string(TAG_PHONE)?;

    if reader.pos != bytes.len() {
        return Err(malformed(&format!(
            "{} trailing bytes",
            bytes.len() - reader.pos
        )));
    }

    Ok(Bundle {
        document_bytes,
        document_name,
        submitter: SubmitterInfo {
            full_name,
            organization,
            phone,
        },
    })
}

fn put_field(out: &mut Vec<u8>, tag: u8, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        malformed(&format!("field {tag:#04x} exceeds {} bytes", u32::MAX))
    })?;
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn malformed(reason: &str) -> RegError {
    RegError::MalformedBundle(reason.to_owned())
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn field(&mut self, expected: u8) -> Result<&'a [u8]> {
        let rest = &self.bytes[self.pos..];
        if rest.len() < FIELD_HEADER_LEN {
            return Err(malformed(&format!(
                "truncated before field {expected:#04x}"
            )));
        }
        if rest[0] != expected {
            return Err(malformed(&format!(
                "expected tag {expected:#04x}, found {:#04x}",
                rest[0]
            )));
        }
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]])
            as usize;
        let body = &rest[FIELD_HEADER_LEN..];
        if body.len() < len {
            return Err(malformed(&format!(
                "field {expected:#04x} declares {len} bytes, {} available",
                body.len()
            )));
        }
        self.pos += FIELD_HEADER_LEN + len;
        Ok(&body[..len])
    }

    fn string(&mut self, expected: u8) -> Result<String> {
        let raw = self.field(expected)?;
        Ok(std::str::from_utf8(raw)?.to_owned())
    }
}
