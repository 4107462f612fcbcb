//! Entry-point discovery.
//!
//! Loading happens in three passes:
//!
//! 1. Decode the image envelope and resolve image-wide imports against the
//!    host modules. Failure here is a hard [`AppError::Load`].
//! 2. Work out which types are usable. A type is usable when everything in
//!    its `requires` list is a host module or another usable type of the
//!    same image; this is iterated to a fixpoint so a broken dependency
//!    takes its dependents down with it.
//! 3. Decode the methods of every usable type one blob at a time. Broken
//!    blobs and unusable types are recorded in `skipped` and discovery
//!    carries on with the rest.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::engine::script::ScriptTask;
use crate::loader::image::{decode_image, decode_method, decode_symbols, Op, RawType, SymbolTable};
use crate::wire::messages::{Catalog, EntryPointInfo};
use crate::{AppError, Result};

/// A discovered entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Declaring type.
    pub type_name: String,
    /// Method name.
    pub method: String,
    /// Catalog summary.
    pub summary: String,
    /// Ordering key.
    pub order: i32,
}

impl EntryPoint {
    /// `Type.method`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.type_name, self.method)
    }
}

/// Executable contents of a loaded image.
#[derive(Debug, Default)]
pub struct CodeUnit {
    methods: HashMap<String, Arc<[Op]>>,
    unavailable: HashMap<String, String>,
    symbols: Option<SymbolTable>,
}

impl CodeUnit {
    /// Body of `type_name.method`.
    ///
    /// # Errors
    ///
    /// A description of why the method cannot be called.
    pub fn body(&self, type_name: &str, method: &str) -> std::result::Result<Arc<[Op]>, String> {
        if let Some(reason) = self.unavailable.get(type_name) {
            return Err(format!("type {type_name} is unavailable: {reason}"));
        }
        self.methods
            .get(&format!("{type_name}.{method}"))
            .cloned()
            .ok_or_else(|| format!("no method {type_name}.{method} in image"))
    }

    /// Source location of op `pc` in `type_name.method`, if symbols know it.
    #[must_use]
    pub fn location(&self, type_name: &str, method: &str, pc: usize) -> Option<String> {
        self.symbols.as_ref()?.location(type_name, method, pc)
    }
}

/// A loaded image and its entry-point catalog.
#[derive(Debug)]
pub struct PortableCode {
    name: String,
    digest: String,
    entry_points: Vec<EntryPoint>,
    skipped: Vec<String>,
    unit: Arc<CodeUnit>,
}

impl PortableCode {
    /// Image name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex SHA-256 of the image bytes.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Entry points in catalog order.
    #[must_use]
    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    /// Diagnostics for everything discovery had to skip.
    #[must_use]
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Catalog in wire form.
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        Catalog {
            image: self.name.clone(),
            digest: self.digest.clone(),
            entries: self
                .entry_points
                .iter()
                .zip(0_u32..)
                .map(|(entry, index)| EntryPointInfo {
                    index,
                    type_name: entry.type_name.clone(),
                    method: entry.method.clone(),
                    summary: entry.summary.clone(),
                    order: entry.order,
                })
                .collect(),
            skipped: self.skipped.clone(),
        }
    }

    /// Build a fresh task for the entry point at `index`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an index outside the catalog.
    pub fn instantiate(&self, index: u32) -> Result<(EntryPoint, ScriptTask)> {
        let entry = usize::try_from(index)
            .ok()
            .and_then(|i| self.entry_points.get(i))
            .ok_or_else(|| AppError::NotFound(format!("no entry point at index {index}")))?;
        let task = ScriptTask::new(Arc::clone(&self.unit), &entry.type_name, &entry.method)
            .map_err(AppError::NotFound)?;
        Ok((entry.clone(), task))
    }
}

/// Load an image and catalog its entry points.
///
/// `modules` are the host modules the target provides.
///
/// # Errors
///
/// Returns `AppError::Load` when the image as a whole cannot be used.
pub fn load(image: &[u8], symbols: Option<&[u8]>, modules: &[String]) -> Result<PortableCode> {
    let raw = decode_image(image)?;

    for import in &raw.imports {
        if !modules.contains(import) {
            return Err(AppError::Load(format!(
                "image {} imports unknown host module '{import}'",
                raw.name
            )));
        }
    }

    let mut skipped = Vec::new();
    let mut seen = HashSet::new();
    let mut types: Vec<&RawType> = Vec::with_capacity(raw.types.len());
    for ty in &raw.types {
        if seen.insert(ty.name.as_str()) {
            types.push(ty);
        } else {
            skipped.push(format!("type {}: declared more than once", ty.name));
        }
    }

    let unavailable = unavailable_types(&types, modules);

    let mut unit = CodeUnit {
        symbols: symbols.and_then(|bytes| match decode_symbols(bytes) {
            Ok(table) => Some(table),
            Err(err) => {
                warn!(image = %raw.name, %err, "ignoring undecodable debug symbols");
                None
            }
        }),
        ..CodeUnit::default()
    };
    let mut entry_points = Vec::new();

    for ty in &types {
        if let Some(reason) = unavailable.get(ty.name.as_str()) {
            skipped.push(format!("type {}: {reason}", ty.name));
            unit.unavailable.insert(ty.name.clone(), reason.clone());
            continue;
        }

        for (position, blob) in ty.methods.iter().enumerate() {
            let method = match decode_method(blob) {
                Ok(method) => method,
                Err(err) => {
                    skipped.push(format!("type {} method #{position}: {err}", ty.name));
                    continue;
                }
            };

            match method.ineligibility() {
                None => {
                    if let Some((summary, order)) = method.entry_marker() {
                        entry_points.push(EntryPoint {
                            type_name: ty.name.clone(),
                            method: method.name.clone(),
                            summary: summary.to_owned(),
                            order,
                        });
                    }
                }
                Some(reason) if method.entry_marker().is_some() => {
                    debug!(type_name = %ty.name, method = %method.name, reason, "marked method is not eligible");
                }
                Some(_) => {}
            }

            unit.methods
                .insert(format!("{}.{}", ty.name, method.name), method.body.into());
        }
    }

    // Stable: equal keys keep discovery order.
    entry_points.sort_by_key(|entry| entry.order);

    info!(
        image = %raw.name,
        entry_points = entry_points.len(),
        skipped = skipped.len(),
        "code image loaded"
    );

    Ok(PortableCode {
        name: raw.name,
        digest: hex_digest(image),
        entry_points,
        skipped,
        unit: Arc::new(unit),
    })
}

/// Types whose dependencies cannot be satisfied, with the reason.
fn unavailable_types(types: &[&RawType], modules: &[String]) -> HashMap<String, String> {
    let mut usable: HashSet<&str> = types.iter().map(|ty| ty.name.as_str()).collect();
    let mut unavailable = HashMap::new();

    loop {
        let mut changed = false;
        for ty in types {
            if !usable.contains(ty.name.as_str()) {
                continue;
            }
            let missing = ty
                .requires
                .iter()
                .find(|dep| !modules.contains(dep) && !usable.contains(dep.as_str()));
            if let Some(dep) = missing {
                usable.remove(ty.name.as_str());
                unavailable.insert(ty.name.clone(), format!("unresolved dependency '{dep}'"));
                changed = true;
            }
        }
        if !changed {
            return unavailable;
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}
