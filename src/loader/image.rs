//! Portable code image format.
//!
//! ```text
//! "LHIM" | u16 BE format version | bincode(RawImage)
//! ```
//!
//! Each method inside a [`RawType`] is stored as its own bincode blob so a
//! single corrupt method can be skipped without losing the rest of the type.
//! Debug symbols travel separately as a bincode [`SymbolTable`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::checkpoint::ChoiceSet;
use crate::wire::serial;
use crate::{AppError, Result};

/// Leading bytes of every code image.
pub const IMAGE_MAGIC: &[u8; 4] = b"LHIM";

/// Image format version understood by this loader.
pub const IMAGE_FORMAT_VERSION: u16 = 1;

/// Decoded image envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    /// Image name.
    pub name: String,
    /// Host modules the whole image needs.
    pub imports: Vec<String>,
    /// Types declared by the image.
    pub types: Vec<RawType>,
}

/// One type as stored in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawType {
    /// Type name.
    pub name: String,
    /// Host modules or image types this type depends on.
    pub requires: Vec<String>,
    /// Encoded [`MethodDef`] blobs.
    pub methods: Vec<Vec<u8>>,
}

impl RawType {
    /// Create an empty type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Add a dependency.
    #[must_use]
    pub fn requires(mut self, dependency: impl Into<String>) -> Self {
        self.requires.push(dependency.into());
        self
    }

    /// Encode and add a method.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the method cannot be encoded.
    pub fn with_method(mut self, method: &MethodDef) -> Result<Self> {
        self.methods.push(encode_method(method)?);
        Ok(self)
    }

    /// Add an already-encoded method blob verbatim.
    #[must_use]
    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.methods.push(blob);
        self
    }
}

/// Method visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Callable from outside the type.
    #[default]
    Public,
    /// Only callable from within the image.
    Private,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub type_name: String,
}

/// Metadata attached to a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Marks a runnable entry point.
    EntryPoint {
        /// Human-readable summary shown in the catalog.
        summary: String,
        /// Ordering key; lower runs first.
        order: i32,
    },
    /// Any other marker, kept opaque.
    Other {
        /// Marker name.
        name: String,
    },
}

/// One method of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Method name.
    pub name: String,
    /// Visibility.
    pub visibility: Visibility,
    /// Whether the method needs no instance.
    pub is_static: bool,
    /// Declared parameters.
    pub params: Vec<ParamDef>,
    /// Attached markers.
    pub attributes: Vec<Attribute>,
    /// Instructions.
    pub body: Vec<Op>,
}

impl MethodDef {
    /// A public static zero-parameter method without markers.
    #[must_use]
    pub fn new(name: impl Into<String>, body: Vec<Op>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            is_static: true,
            params: Vec::new(),
            attributes: Vec::new(),
            body,
        }
    }

    /// A method carrying the entry-point marker.
    #[must_use]
    pub fn entry_point(
        name: impl Into<String>,
        summary: impl Into<String>,
        order: i32,
        body: Vec<Op>,
    ) -> Self {
        let mut method = Self::new(name, body);
        method.attributes.push(Attribute::EntryPoint {
            summary: summary.into(),
            order,
        });
        method
    }

    /// The entry-point marker, if present.
    #[must_use]
    pub fn entry_marker(&self) -> Option<(&str, i32)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::EntryPoint { summary, order } => Some((summary.as_str(), *order)),
            Attribute::Other { .. } => None,
        })
    }

    /// Why the method cannot be an entry point, if it cannot.
    #[must_use]
    pub fn ineligibility(&self) -> Option<&'static str> {
        if self.entry_marker().is_none() {
            Some("no entry-point marker")
        } else if self.visibility != Visibility::Public {
            Some("not public")
        } else if !self.is_static {
            Some("not static")
        } else if !self.params.is_empty() {
            Some("takes parameters")
        } else {
            None
        }
    }
}

/// Instruction set of portable code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Write a log line.
    Log {
        /// Text.
        message: String,
    },
    /// Suspend for logical seconds.
    Wait {
        /// Logical seconds.
        seconds: f64,
    },
    /// Suspend for a number of engine ticks.
    WaitFrames {
        /// Tick count.
        frames: u32,
    },
    /// Suspend until a UI element is clickable; opens a checkpoint on timeout.
    WaitUntilClickable {
        /// Element name.
        element: String,
        /// Logical seconds before giving up.
        timeout_seconds: f64,
    },
    /// Click a UI element; opens a checkpoint if it is not clickable.
    Click {
        /// Element name.
        element: String,
    },
    /// Press and hold a key.
    KeyDown {
        /// Key name.
        key: String,
    },
    /// Release a key.
    KeyUp {
        /// Key name.
        key: String,
    },
    /// Press a key and release it on the next tick.
    Press {
        /// Key name.
        key: String,
    },
    /// Invoke another method of the image.
    Call {
        /// Declaring type.
        type_name: String,
        /// Method name.
        method: String,
    },
    /// Ask the operator before continuing.
    Checkpoint {
        /// Question text.
        message: String,
        /// Decisions offered.
        #[serde(default)]
        choices: ChoiceSet,
    },
    /// Fail the run.
    Fail {
        /// Failure description.
        message: String,
    },
    /// Give up the rest of the tick.
    Yield,
}

/// Debug symbols: source lines for each op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Source file the image was compiled from.
    pub source_file: String,
    /// `Type.method` to one source line per op.
    pub lines: BTreeMap<String, Vec<u32>>,
}

impl SymbolTable {
    /// `file:line` of op `pc` in `type_name.method`, if known.
    #[must_use]
    pub fn location(&self, type_name: &str, method: &str, pc: usize) -> Option<String> {
        let line = self
            .lines
            .get(&format!("{type_name}.{method}"))?
            .get(pc)?;
        Some(format!("{}:{line}", self.source_file))
    }
}

/// Serialize an image with magic and format version.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the image cannot be encoded.
pub fn encode_image(raw: &RawImage) -> Result<Vec<u8>> {
    let body = serial::to_vec(raw)?;
    let mut out = Vec::with_capacity(IMAGE_MAGIC.len() + 2 + body.len());
    out.extend_from_slice(IMAGE_MAGIC);
    out.extend_from_slice(&IMAGE_FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse the image envelope.
///
/// # Errors
///
/// Returns `AppError::Load` for a bad magic, an unsupported version, or a
/// body that does not decode.
pub fn decode_image(bytes: &[u8]) -> Result<RawImage> {
    let body = bytes
        .strip_prefix(IMAGE_MAGIC.as_slice())
        .ok_or_else(|| AppError::Load("not a code image (bad magic)".into()))?;
    let (version, body) = match body {
        [hi, lo, rest @ ..] => (u16::from_be_bytes([*hi, *lo]), rest),
        _ => return Err(AppError::Load("truncated image header".into())),
    };
    if version != IMAGE_FORMAT_VERSION {
        return Err(AppError::Load(format!(
            "unsupported image format version {version}"
        )));
    }
    serial::from_slice(body, body.len())
        .map_err(|err| AppError::Load(format!("image body does not decode: {err}")))
}

/// Encode one method blob.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the method cannot be encoded.
pub fn encode_method(method: &MethodDef) -> Result<Vec<u8>> {
    serial::to_vec(method)
}

/// Decode one method blob.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the blob is malformed.
pub fn decode_method(blob: &[u8]) -> Result<MethodDef> {
    serial::from_slice(blob, blob.len())
}

/// Encode a symbol table.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the table cannot be encoded.
pub fn encode_symbols(symbols: &SymbolTable) -> Result<Vec<u8>> {
    serial::to_vec(symbols)
}

/// Decode a symbol table.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the bytes are malformed.
pub fn decode_symbols(bytes: &[u8]) -> Result<SymbolTable> {
    serial::from_slice(bytes, bytes.len())
}

/// Encoded image plus optional encoded symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Image bytes.
    pub image: Vec<u8>,
    /// Symbol bytes.
    pub symbols: Option<Vec<u8>>,
}

/// Programmatic image construction.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    raw: RawImage,
    symbols: Option<SymbolTable>,
}

impl ImageBuilder {
    /// Start an image with no imports and no types.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            raw: RawImage {
                name: name.into(),
                imports: Vec::new(),
                types: Vec::new(),
            },
            symbols: None,
        }
    }

    /// Require a host module for the whole image.
    #[must_use]
    pub fn import(mut self, module: impl Into<String>) -> Self {
        self.raw.imports.push(module.into());
        self
    }

    /// Add a type.
    #[must_use]
    pub fn with_type(mut self, ty: RawType) -> Self {
        self.raw.types.push(ty);
        self
    }

    /// Attach debug symbols.
    #[must_use]
    pub fn with_symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = Some(symbols);
        self
    }

    /// Encode image and symbols.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if encoding fails.
    pub fn build(&self) -> Result<BuiltImage> {
        Ok(BuiltImage {
            image: encode_image(&self.raw)?,
            symbols: self.symbols.as_ref().map(encode_symbols).transpose()?,
        })
    }
}

/// TOML description of an image, compiled by `live-harness-ctl compile`.
///
/// ```toml
/// name = "smoke"
/// imports = ["host.input"]
/// source_file = "smoke.lhs"
///
/// [[types]]
/// name = "MainMenu"
/// requires = ["host.ui"]
///
/// [[types.methods]]
/// name = "opens"
/// entry_point = { summary = "main menu opens", order = -1000 }
/// body = [{ wait_until_clickable = { element = "play", timeout_seconds = 5.0 } }]
/// lines = [12]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageManifest {
    /// Image name.
    pub name: String,
    /// Host modules the whole image needs.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Source file recorded in the debug symbols.
    #[serde(default)]
    pub source_file: Option<String>,
    /// Types.
    #[serde(default)]
    pub types: Vec<ManifestType>,
}

/// A type in an [`ImageManifest`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ManifestType {
    /// Type name.
    pub name: String,
    /// Dependencies.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Methods.
    #[serde(default)]
    pub methods: Vec<ManifestMethod>,
}

/// Entry-point marker in manifest form.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntryPointMarker {
    /// Catalog summary.
    pub summary: String,
    /// Ordering key.
    #[serde(default)]
    pub order: i32,
}

/// A method in an [`ImageManifest`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ManifestMethod {
    /// Method name.
    pub name: String,
    /// Visibility.
    #[serde(default)]
    pub visibility: Visibility,
    /// Static or instance method.
    #[serde(default = "default_is_static")]
    pub is_static: bool,
    /// Parameters.
    #[serde(default)]
    pub params: Vec<ParamDef>,
    /// Entry-point marker.
    #[serde(default)]
    pub entry_point: Option<EntryPointMarker>,
    /// Other marker names.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Instructions.
    #[serde(default)]
    pub body: Vec<Op>,
    /// Source line per instruction.
    #[serde(default)]
    pub lines: Vec<u32>,
}

fn default_is_static() -> bool {
    true
}

impl ManifestMethod {
    fn to_method_def(&self) -> MethodDef {
        let mut attributes: Vec<Attribute> = self
            .entry_point
            .iter()
            .map(|marker| Attribute::EntryPoint {
                summary: marker.summary.clone(),
                order: marker.order,
            })
            .collect();
        attributes.extend(
            self.attributes
                .iter()
                .map(|name| Attribute::Other { name: name.clone() }),
        );
        MethodDef {
            name: self.name.clone(),
            visibility: self.visibility,
            is_static: self.is_static,
            params: self.params.clone(),
            attributes,
            body: self.body.clone(),
        }
    }
}

impl ImageManifest {
    /// Parse a manifest from TOML.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on invalid TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read manifest: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Turn the manifest into an image builder.
    ///
    /// Symbols are emitted when a source file is named or any method lists
    /// source lines.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a method lists a different number of
    /// lines than instructions, or `AppError::Protocol` if encoding fails.
    pub fn to_builder(&self) -> Result<ImageBuilder> {
        let mut builder = ImageBuilder::new(&self.name);
        for module in &self.imports {
            builder = builder.import(module);
        }

        let mut symbols = SymbolTable {
            source_file: self.source_file.clone().unwrap_or_default(),
            lines: BTreeMap::new(),
        };
        for ty in &self.types {
            let mut raw = RawType::new(&ty.name);
            raw.requires.clone_from(&ty.requires);
            for method in &ty.methods {
                if !method.lines.is_empty() {
                    if method.lines.len() != method.body.len() {
                        return Err(AppError::Config(format!(
                            "{}.{}: {} source lines for {} instructions",
                            ty.name,
                            method.name,
                            method.lines.len(),
                            method.body.len()
                        )));
                    }
                    symbols
                        .lines
                        .insert(format!("{}.{}", ty.name, method.name), method.lines.clone());
                }
                raw = raw.with_method(&method.to_method_def())?;
            }
            builder = builder.with_type(raw);
        }

        if self.source_file.is_some() || !symbols.lines.is_empty() {
            builder = builder.with_symbols(symbols);
        }
        Ok(builder)
    }
}
