//! Runtime specialization of codec trees.
//!
//! [`specialize`] rewrites a codec tree so that decoding yields values in
//! the representation a caller asked for. The walk is depth-first and
//! driven by the host type:
//!
//! - objects resolve each field by name against the host shape (falling
//!   back to the native representation for fields the shape doesn't name)
//! - tuples match host element types by position
//! - compilable wrappers specialize their element first, then compile
//! - brokers hand out (and keep) a runtime codec per host type
//! - compounds pick the component that fits the host type
//!
//! Results are memoized per (codec id, host type) in the [`CodecCache`].

use std::sync::Arc;

use super::builder::CodecCache;
use super::codecs::{complex, ArrayCodec, Codec, CodecRef, MultiRangeCodec, RangeCodec, SetCodec};
use super::host::HostType;
use crate::error::{EdgeError, Result};

/// Specialize `codec` for `host`, memoized in `cache`.
pub fn specialize(cache: &CodecCache, codec: &CodecRef, host: &HostType) -> Result<CodecRef> {
    let target = host.unwrap_optional();
    if matches!(target, HostType::Dynamic | HostType::Ignore) {
        return Ok(Arc::clone(codec));
    }
    let key = (codec.id(), target.clone());
    if let Some(hit) = cache.specialization(&key) {
        return Ok(hit);
    }

    let mut visitor = TypeVisitor::new(cache);
    if let HostType::Object(shape) = target {
        visitor.frames.push(shape.name.clone());
    }
    let built = visitor.visit(codec, target)?;
    tracing::debug!(id = %key.0, host = %target, "specialized codec");
    Ok(cache.store_specialization(key, built))
}

/// Depth-first walker carrying the path of entered contexts.
pub struct TypeVisitor<'c> {
    cache: &'c CodecCache,
    frames: Vec<String>,
}

impl<'c> TypeVisitor<'c> {
    pub fn new(cache: &'c CodecCache) -> Self {
        Self {
            cache,
            frames: Vec::new(),
        }
    }

    /// Dotted path of the current position, e.g. `User.friends[].name`.
    pub fn path(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            if !out.is_empty() && !frame.starts_with('[') {
                out.push('.');
            }
            out.push_str(frame);
        }
        out
    }

    fn no_converter(&self, codec: &Codec, host: &HostType, reason: impl Into<String>) -> EdgeError {
        EdgeError::NoTypeConverter {
            host: host.to_string(),
            codec: codec.type_name(),
            path: self.path(),
            reason: reason.into(),
        }
    }

    /// Attach the current path to errors raised below this point.
    fn with_path(&self, err: EdgeError) -> EdgeError {
        match err {
            EdgeError::NoTypeConverter {
                host,
                codec,
                path,
                reason,
            } if path.is_empty() => EdgeError::NoTypeConverter {
                host,
                codec,
                path: self.path(),
                reason,
            },
            other => other,
        }
    }

    fn enter<T>(&mut self, frame: impl Into<String>, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.frames.push(frame.into());
        let result = f(self);
        self.frames.pop();
        result
    }

    pub fn visit(&mut self, codec: &CodecRef, host: &HostType) -> Result<CodecRef> {
        let host = host.unwrap_optional();
        if matches!(host, HostType::Dynamic | HostType::Ignore) || codec.converter_type() == *host {
            return Ok(Arc::clone(codec));
        }

        match &**codec {
            Codec::Null | Codec::Scalar(_) | Codec::Enum(_) | Codec::SparseObject(_) => {
                if codec.accepts(host) {
                    Ok(Arc::clone(codec))
                } else {
                    Err(self.no_converter(codec, host, "incompatible wire type"))
                }
            }
            Codec::Complex(_) => complex::codec_for(codec, host).map_err(|e| self.with_path(e)),
            Codec::Runtime(runtime) => {
                let broker = runtime.broker().ok_or_else(|| {
                    EdgeError::Internal("runtime codec outlived its broker".to_string())
                })?;
                self.visit(&broker, host)
            }
            Codec::Object(object) => {
                let shape = match host {
                    HostType::Object(shape) => shape,
                    _ => return Err(self.no_converter(codec, host, "host type is not an object")),
                };
                if let Some(hit) = object.typed_for(shape) {
                    return Ok(hit);
                }
                let mut children = Vec::with_capacity(object.codecs.len());
                for (name, child) in object.names.iter().zip(&object.codecs) {
                    let field_host = shape
                        .lookup(name)
                        .map(|(_, ty)| ty.clone())
                        .unwrap_or(HostType::Dynamic);
                    children.push(self.enter(name.as_str(), |v| v.visit(child, &field_host))?);
                }
                let built = Arc::new(Codec::Object(object.specialized(Arc::clone(shape), children)));
                Ok(object.store_typed(Arc::clone(shape), built))
            }
            Codec::Tuple(tuple) => {
                let items = match host {
                    HostType::Tuple(items) if items.len() == tuple.codecs.len() => items,
                    _ => {
                        return Err(self.no_converter(
                            codec,
                            host,
                            "cannot determine the element types of the tuple",
                        ))
                    }
                };
                let mut children = Vec::with_capacity(items.len());
                for (i, (child, ty)) in tuple.codecs.iter().zip(items).enumerate() {
                    children.push(self.enter(i.to_string(), |v| v.visit(child, ty))?);
                }
                if children.iter().zip(&tuple.codecs).all(|(a, b)| Arc::ptr_eq(a, b)) {
                    return Ok(Arc::clone(codec));
                }
                Ok(Arc::new(Codec::Tuple(super::codecs::TupleCodec::new(
                    tuple.id,
                    children,
                    tuple.metadata.clone(),
                ))))
            }
            Codec::Compilable(compilable) => {
                if !compilable.kind.matches_host(host) {
                    return Err(self.no_converter(codec, host, "collection kind mismatch"));
                }
                let element = host.element_type();
                let inner = self.enter("[]", |v| v.visit(&compilable.inner, &element))?;
                let compiled = self
                    .cache
                    .compiled_or_insert((compilable.id, host.clone()), || compilable.compile(inner));
                self.visit(&compiled, host)
            }
            Codec::Array(array) => {
                if !matches!(host, HostType::Array(_)) {
                    return Err(self.no_converter(codec, host, "host type is not an array"));
                }
                let inner = self.visit_element(&array.inner, host)?;
                if Arc::ptr_eq(&inner, &array.inner) {
                    return Ok(Arc::clone(codec));
                }
                Ok(Arc::new(Codec::Array(ArrayCodec {
                    id: array.id,
                    inner,
                    metadata: array.metadata.clone(),
                    dimensions: array.dimensions.clone(),
                })))
            }
            Codec::Set(set) => {
                if !matches!(host, HostType::Set(_) | HostType::Array(_)) {
                    return Err(self.no_converter(codec, host, "host type is not a collection"));
                }
                let inner = self.visit_element(&set.inner, host)?;
                if Arc::ptr_eq(&inner, &set.inner) {
                    return Ok(Arc::clone(codec));
                }
                Ok(Arc::new(Codec::Set(SetCodec {
                    id: set.id,
                    inner,
                    metadata: set.metadata.clone(),
                })))
            }
            Codec::Range(range) => {
                if !matches!(host, HostType::Range(_)) {
                    return Err(self.no_converter(codec, host, "host type is not a range"));
                }
                let inner = self.visit_element(&range.inner, host)?;
                if Arc::ptr_eq(&inner, &range.inner) {
                    return Ok(Arc::clone(codec));
                }
                Ok(Arc::new(Codec::Range(RangeCodec {
                    id: range.id,
                    inner,
                    metadata: range.metadata.clone(),
                })))
            }
            Codec::MultiRange(multi) => {
                if !matches!(host, HostType::MultiRange(_)) {
                    return Err(self.no_converter(codec, host, "host type is not a multirange"));
                }
                let inner = self.visit_element(&multi.inner, host)?;
                if Arc::ptr_eq(&inner, &multi.inner) {
                    return Ok(Arc::clone(codec));
                }
                Ok(Arc::new(Codec::MultiRange(MultiRangeCodec {
                    id: multi.id,
                    inner,
                    metadata: multi.metadata.clone(),
                })))
            }
            Codec::Compound(compound) => {
                let component = compound.resolve(host).map_err(|e| self.with_path(e))?;
                self.visit(&component, host)
            }
        }
    }

    fn visit_element(&mut self, inner: &CodecRef, host: &HostType) -> Result<CodecRef> {
        let element = host.element_type();
        self.enter("[]", |v| v.visit(inner, &element))
    }
}
