// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resource archive (`omni.ja`) reading and writing.

`omni.ja` files are zip archives, optionally in an *optimized* layout that
lets the browser read a prefix of the file at startup:

```text
u32le preload_size | central directory | end record | local entries | end record
```

`preload_size` is the offset of the end of the last preloaded local entry.
Standard archives start with a local file header instead, which is how the
two layouts are told apart.

Entries are copied verbatim, compressed data included, so re-signing
an archive does not recompress existing content.
*/

use {
    crate::error::{Result, SigningError},
    flate2::{read::DeflateDecoder, write::DeflateEncoder, Crc},
    std::{
        io::{Read, Write},
        path::Path,
    },
};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

const LOCAL_HEADER_SIZE: usize = 30;
const CENTRAL_DIRECTORY_HEADER_SIZE: usize = 46;
const END_OF_CENTRAL_DIRECTORY_SIZE: usize = 22;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Flag indicating sizes follow the data in a descriptor.
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// 1980-01-01 00:00:00 in MS-DOS format.
const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;

fn jar_error(msg: impl ToString) -> SigningError {
    SigningError::Container {
        path: "omni.ja".into(),
        cause: msg.to_string(),
    }
}

fn u16_at(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| jar_error(format!("truncated archive reading offset {}", pos)))
}

fn u32_at(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| jar_error(format!("truncated archive reading offset {}", pos)))
}

fn bytes_at(data: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    data.get(pos..pos + len)
        .ok_or_else(|| jar_error(format!("truncated archive reading {} bytes at {}", len, pos)))
}

/// An archive entry with its compressed data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JarEntry {
    pub name: String,
    pub method: u16,
    pub version_made: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub uncompressed_size: u32,
    pub external_attr: u32,
    pub data: Vec<u8>,
    offset: u32,
}

impl JarEntry {
    /// Create an entry from uncompressed content.
    ///
    /// Content is deflated when `compress` is set and deflating makes it
    /// smaller.
    pub fn new(name: &str, content: &[u8], compress: bool) -> Result<Self> {
        let mut crc = Crc::new();
        crc.update(content);

        let mut method = METHOD_STORED;
        let mut data = content.to_vec();

        if compress {
            let mut encoder = DeflateEncoder::new(vec![], flate2::Compression::default());
            encoder.write_all(content)?;
            let deflated = encoder.finish()?;
            if deflated.len() < content.len() {
                method = METHOD_DEFLATED;
                data = deflated;
            }
        }

        Ok(Self {
            name: name.to_string(),
            method,
            version_made: 20,
            version_needed: if method == METHOD_DEFLATED { 20 } else { 10 },
            flags: 0,
            mod_time: 0,
            mod_date: DOS_EPOCH_DATE,
            crc32: crc.sum(),
            uncompressed_size: content.len() as u32,
            external_attr: 0,
            data,
            offset: 0,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.method != METHOD_STORED
    }

    /// Obtain the uncompressed content.
    pub fn decompressed(&self) -> Result<Vec<u8>> {
        match self.method {
            METHOD_STORED => Ok(self.data.clone()),
            METHOD_DEFLATED => {
                let mut res = Vec::with_capacity(self.uncompressed_size as usize);
                DeflateDecoder::new(self.data.as_slice()).read_to_end(&mut res)?;
                Ok(res)
            }
            method => Err(jar_error(format!(
                "entry {} uses unsupported compression method {}",
                self.name, method
            ))),
        }
    }

    fn local_header(&self) -> Vec<u8> {
        let mut h = Vec::with_capacity(LOCAL_HEADER_SIZE + self.name.len());
        h.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
        h.extend_from_slice(&self.version_needed.to_le_bytes());
        h.extend_from_slice(&(self.flags & !FLAG_DATA_DESCRIPTOR).to_le_bytes());
        h.extend_from_slice(&self.method.to_le_bytes());
        h.extend_from_slice(&self.mod_time.to_le_bytes());
        h.extend_from_slice(&self.mod_date.to_le_bytes());
        h.extend_from_slice(&self.crc32.to_le_bytes());
        h.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        h.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        h.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        h.extend_from_slice(self.name.as_bytes());
        h
    }

    fn central_directory_header(&self, offset: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(CENTRAL_DIRECTORY_HEADER_SIZE + self.name.len());
        h.extend_from_slice(&CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        h.extend_from_slice(&self.version_made.to_le_bytes());
        h.extend_from_slice(&self.version_needed.to_le_bytes());
        h.extend_from_slice(&(self.flags & !FLAG_DATA_DESCRIPTOR).to_le_bytes());
        h.extend_from_slice(&self.method.to_le_bytes());
        h.extend_from_slice(&self.mod_time.to_le_bytes());
        h.extend_from_slice(&self.mod_date.to_le_bytes());
        h.extend_from_slice(&self.crc32.to_le_bytes());
        h.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        h.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        h.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        // Extra field, comment, disk number and internal attributes.
        h.extend_from_slice(&[0u8; 8]);
        h.extend_from_slice(&self.external_attr.to_le_bytes());
        h.extend_from_slice(&offset.to_le_bytes());
        h.extend_from_slice(self.name.as_bytes());
        h
    }
}

fn end_of_central_directory(count: usize, size: usize, offset: usize) -> Vec<u8> {
    let mut h = Vec::with_capacity(END_OF_CENTRAL_DIRECTORY_SIZE);
    h.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
    h.extend_from_slice(&[0u8; 4]);
    h.extend_from_slice(&(count as u16).to_le_bytes());
    h.extend_from_slice(&(count as u16).to_le_bytes());
    h.extend_from_slice(&(size as u32).to_le_bytes());
    h.extend_from_slice(&(offset as u32).to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes());
    h
}

/// A parsed resource archive.
#[derive(Clone, Debug)]
pub struct JarReader {
    entries: Vec<JarEntry>,
    preload_size: Option<u32>,
}

impl JarReader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < END_OF_CENTRAL_DIRECTORY_SIZE {
            return Err(jar_error("too small to be a zip archive"));
        }

        // The last end record wins. Optimized archives have two.
        let earliest = data
            .len()
            .saturating_sub(END_OF_CENTRAL_DIRECTORY_SIZE + u16::MAX as usize);
        let eocd = (earliest..=data.len() - END_OF_CENTRAL_DIRECTORY_SIZE)
            .rev()
            .find(|pos| {
                u32_at(data, *pos)
                    .map(|v| v == END_OF_CENTRAL_DIRECTORY_SIGNATURE)
                    .unwrap_or(false)
            })
            .ok_or_else(|| jar_error("end of central directory not found"))?;

        let count = u16_at(data, eocd + 10)? as usize;
        let mut pos = u32_at(data, eocd + 16)? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if u32_at(data, pos)? != CENTRAL_DIRECTORY_SIGNATURE {
                return Err(jar_error(format!("bad central directory entry at {}", pos)));
            }

            let name_len = u16_at(data, pos + 28)? as usize;
            let extra_len = u16_at(data, pos + 30)? as usize;
            let comment_len = u16_at(data, pos + 32)? as usize;
            let compressed_size = u32_at(data, pos + 20)? as usize;
            let offset = u32_at(data, pos + 42)?;
            let name = String::from_utf8_lossy(bytes_at(
                data,
                pos + CENTRAL_DIRECTORY_HEADER_SIZE,
                name_len,
            )?)
            .to_string();

            let local = offset as usize;
            if u32_at(data, local)? != LOCAL_HEADER_SIGNATURE {
                return Err(jar_error(format!("bad local header for {}", name)));
            }
            let local_name_len = u16_at(data, local + 26)? as usize;
            let local_extra_len = u16_at(data, local + 28)? as usize;
            let data_start = local + LOCAL_HEADER_SIZE + local_name_len + local_extra_len;

            entries.push(JarEntry {
                name,
                version_made: u16_at(data, pos + 4)?,
                version_needed: u16_at(data, pos + 6)?,
                flags: u16_at(data, pos + 8)?,
                method: u16_at(data, pos + 10)?,
                mod_time: u16_at(data, pos + 12)?,
                mod_date: u16_at(data, pos + 14)?,
                crc32: u32_at(data, pos + 16)?,
                uncompressed_size: u32_at(data, pos + 24)?,
                external_attr: u32_at(data, pos + 38)?,
                data: bytes_at(data, data_start, compressed_size)?.to_vec(),
                offset,
            });

            pos += CENTRAL_DIRECTORY_HEADER_SIZE + name_len + extra_len + comment_len;
        }

        let first = u32_at(data, 0)?;
        let preload_size = if first == LOCAL_HEADER_SIGNATURE || entries.is_empty() {
            None
        } else {
            Some(first)
        };

        Ok(Self {
            entries,
            preload_size,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
        Self::from_bytes(&data).map_err(|e| match e {
            SigningError::Container { cause, .. } => SigningError::container(path, cause),
            e => e,
        })
    }

    /// Entries in central directory order.
    pub fn entries(&self) -> &[JarEntry] {
        &self.entries
    }

    pub fn is_optimized(&self) -> bool {
        self.preload_size.is_some()
    }

    /// Name of the last entry inside the preloaded region.
    pub fn last_preloaded(&self) -> Option<&str> {
        let preload = self.preload_size?;

        self.entries
            .iter()
            .take_while(|e| e.offset < preload)
            .last()
            .map(|e| e.name.as_str())
    }

    /// Whether the archive stores content compressed.
    pub fn is_compressed(&self) -> bool {
        self.entries.iter().any(|e| e.is_compressed())
    }
}

/// Assembles a resource archive.
#[derive(Clone, Debug, Default)]
pub struct JarWriter {
    entries: Vec<JarEntry>,
    last_preloaded: Option<String>,
}

impl JarWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. An existing entry of the same name is replaced in place.
    pub fn add(&mut self, entry: JarEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Move the named entries to the front, in the given order, and write
    /// the optimized layout with them preloaded.
    ///
    /// Names that are not entries are ignored.
    pub fn preload<S: AsRef<str>>(&mut self, names: &[S]) {
        let mut front = vec![];
        for name in names {
            if let Some(pos) = self.entries.iter().position(|e| e.name == name.as_ref()) {
                front.push(self.entries.remove(pos));
            }
        }

        self.last_preloaded = front.last().map(|e| e.name.clone());
        front.append(&mut self.entries);
        self.entries = front;
    }

    /// Serialize the archive.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut locals = vec![];
        let mut offsets = vec![];
        let mut preload_end = None;

        for entry in &self.entries {
            if entry.data.len() > u32::MAX as usize {
                return Err(jar_error(format!("entry {} is too large", entry.name)));
            }
            offsets.push(locals.len());
            locals.extend_from_slice(&entry.local_header());
            locals.extend_from_slice(&entry.data);

            if self.last_preloaded.as_deref() == Some(entry.name.as_str()) {
                preload_end = Some(locals.len());
            }
        }

        let cdir_size = self
            .entries
            .iter()
            .map(|e| CENTRAL_DIRECTORY_HEADER_SIZE + e.name.len())
            .sum::<usize>();

        let mut out = vec![];

        match preload_end {
            Some(preload_end) => {
                let base = 4 + cdir_size + END_OF_CENTRAL_DIRECTORY_SIZE;
                let end = end_of_central_directory(self.entries.len(), cdir_size, 4);

                out.extend_from_slice(&((preload_end + base) as u32).to_le_bytes());
                for (entry, offset) in self.entries.iter().zip(offsets.iter()) {
                    out.extend_from_slice(&entry.central_directory_header((offset + base) as u32));
                }
                out.extend_from_slice(&end);
                out.extend_from_slice(&locals);
                out.extend_from_slice(&end);
            }
            None => {
                out.extend_from_slice(&locals);
                for (entry, offset) in self.entries.iter().zip(offsets.iter()) {
                    out.extend_from_slice(&entry.central_directory_header(*offset as u32));
                }
                out.extend_from_slice(&end_of_central_directory(
                    self.entries.len(),
                    cdir_size,
                    locals.len(),
                ));
            }
        }

        Ok(out)
    }
}

/// Produce a resource archive combining `original` with the signature
/// files of `signed`.
///
/// All entries of `original` are kept byte for byte. `META-INF` entries of
/// the signed copy are added. When `original` is optimized, its preload
/// list is kept.
pub fn merge_signature(original: &Path, signed: &Path, dest: &Path) -> Result<()> {
    let orig = JarReader::from_path(original)?;
    let signed = JarReader::from_path(signed)?;
    let compress = orig.is_compressed();

    let mut writer = JarWriter::new();
    for entry in orig.entries() {
        writer.add(entry.clone());
    }

    for entry in signed
        .entries()
        .iter()
        .filter(|e| e.name.starts_with("META-INF"))
    {
        writer.add(JarEntry::new(&entry.name, &entry.decompressed()?, compress)?);
    }

    if let Some(last) = orig.last_preloaded() {
        let mut names = vec![];
        for entry in orig.entries() {
            names.push(entry.name.as_str());
            if entry.name == last {
                break;
            }
        }
        writer.preload(&names);
    }

    crate::io::write_bytes_atomically(dest, &writer.to_bytes()?)
}
