use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::{CodecMetadata, CodecRef};
use crate::binary::descriptors::CompoundOperation;
use crate::binary::host::HostType;
use crate::error::{EdgeError, Result};

/// Union or intersection of component shapes. Never decodes by itself: a
/// concrete component is chosen per host type first.
#[derive(Debug)]
pub struct CompoundCodec {
    pub id: Uuid,
    pub operation: CompoundOperation,
    pub components: Vec<CodecRef>,
    pub metadata: Option<CodecMetadata>,
    resolved: RwLock<HashMap<HostType, CodecRef>>,
}

impl CompoundCodec {
    pub fn new(
        id: Uuid,
        operation: CompoundOperation,
        components: Vec<CodecRef>,
        metadata: Option<CodecMetadata>,
    ) -> Self {
        Self {
            id,
            operation,
            components,
            metadata,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Component codec that represents `host`; the first match wins and is
    /// remembered.
    pub fn resolve(&self, host: &HostType) -> Result<CodecRef> {
        let host = host.unwrap_optional();
        if let Some(hit) = self.resolved.read().get(host) {
            return Ok(Arc::clone(hit));
        }
        let found = if host.is_dynamic() {
            self.components.first()
        } else {
            self.components.iter().find(|c| c.accepts(host))
        };
        let found = found.cloned().ok_or_else(|| EdgeError::NoTypeConverter {
            host: host.to_string(),
            codec: self.name(),
            path: String::new(),
            reason: "no component matches".to_string(),
        })?;
        Ok(Arc::clone(
            self.resolved.write().entry(host.clone()).or_insert(found),
        ))
    }

    fn name(&self) -> String {
        self.metadata
            .as_ref()
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| format!("{:?}", self.operation).to_lowercase())
    }

    pub(super) fn unresolved(&self) -> EdgeError {
        EdgeError::Internal(format!(
            "compound codec {} must be resolved against a host type before use",
            self.name()
        ))
    }
}
