// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::ArtifactError;

/// Payload storage behind the artifact bus.
///
/// The bus hands drivers opaque bytes; `compressed` only selects the file
/// suffix / bucket key so payloads stay self-describing at rest.
pub trait StorageDriver: Send + Sync {
    fn write_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), ArtifactError>;

    fn read_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        compressed: bool,
    ) -> Result<Vec<u8>, ArtifactError>;

    fn delete_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        compressed: bool,
    ) -> Result<(), ArtifactError>;
}

/// Filesystem driver: `{base}/artifacts/{session}/{ref}.json[.gz]`.
pub struct FsDriver {
    base_dir: PathBuf,
}

impl FsDriver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path(&self, session_id: &str, ref_id: &str, compressed: bool) -> PathBuf {
        let suffix = if compressed { "json.gz" } else { "json" };
        self.base_dir
            .join("artifacts")
            .join(session_id)
            .join(format!("{ref_id}.{suffix}"))
    }

    fn io_err(ref_id: &str, source: std::io::Error) -> ArtifactError {
        ArtifactError::Storage {
            ref_id: ref_id.to_string(),
            source,
        }
    }
}

impl StorageDriver for FsDriver {
    fn write_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), ArtifactError> {
        let path = self.path(session_id, ref_id, compressed);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(ref_id, e))?;
        }
        std::fs::write(&path, payload).map_err(|e| Self::io_err(ref_id, e))
    }

    fn read_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        compressed: bool,
    ) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path(session_id, ref_id, compressed);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(ref_id.to_string()))
            }
            Err(e) => Err(Self::io_err(ref_id, e)),
        }
    }

    fn delete_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        compressed: bool,
    ) -> Result<(), ArtifactError> {
        let path = self.path(session_id, ref_id, compressed);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(ref_id, e)),
        }
    }
}

/// In-process driver used by tests and embedded deployments that do not
/// need payloads to outlive the process.
#[derive(Default)]
pub struct MemoryDriver {
    payloads: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl StorageDriver for MemoryDriver {
    fn write_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        payload: &[u8],
        _compressed: bool,
    ) -> Result<(), ArtifactError> {
        self.payloads
            .lock()
            .unwrap()
            .insert((session_id.to_string(), ref_id.to_string()), payload.to_vec());
        Ok(())
    }

    fn read_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        _compressed: bool,
    ) -> Result<Vec<u8>, ArtifactError> {
        self.payloads
            .lock()
            .unwrap()
            .get(&(session_id.to_string(), ref_id.to_string()))
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(ref_id.to_string()))
    }

    fn delete_payload(
        &self,
        session_id: &str,
        ref_id: &str,
        _compressed: bool,
    ) -> Result<(), ArtifactError> {
        self.payloads
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), ref_id.to_string()));
        Ok(())
    }
}

/// Gzip helper shared by the bus for oversized payloads.
pub(crate) fn gzip(raw: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).expect("in-memory write cannot fail");
    encoder.finish().expect("in-memory gzip cannot fail")
}

pub(crate) fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
