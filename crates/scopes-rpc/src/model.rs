//! Result and query records
//!
//! Everything here crosses the wire as a `VariantMap`; each record has a
//! `serialize`/`from_variant` pair. The records are deliberately small:
//! rendering concerns beyond the category descriptor are out of scope.

use crate::error::{MiddlewareError, Result};
use scopes_wire::{Variant, VariantMap};

fn required_str(map: &VariantMap, key: &str, what: &str) -> Result<String> {
    map.get(key)
        .and_then(Variant::as_str)
        .map(str::to_string)
        .ok_or_else(|| MiddlewareError::Logic(format!("{}: missing '{}' field", what, key)))
}

fn optional_str(map: &VariantMap, key: &str) -> String {
    map.get(key)
        .and_then(Variant::as_str)
        .unwrap_or_default()
        .to_string()
}

/// A single search result
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeResult {
    pub uri: String,
    pub title: String,
    pub art: String,
    pub category_id: String,
    /// Scope-defined extra attributes
    pub attributes: VariantMap,
}

impl ScopeResult {
    pub fn new(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: title.into(),
            art: String::new(),
            category_id: String::new(),
            attributes: VariantMap::new(),
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = category_id.into();
        self
    }

    pub fn with_art(mut self, art: impl Into<String>) -> Self {
        self.art = art.into();
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Variant) {
        self.attributes.insert(key.into(), value);
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("uri".into(), Variant::from(self.uri.clone()));
        map.insert("title".into(), Variant::from(self.title.clone()));
        map.insert("art".into(), Variant::from(self.art.clone()));
        map.insert("cat_id".into(), Variant::from(self.category_id.clone()));
        map.insert("attrs".into(), Variant::Dict(self.attributes.clone()));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            uri: required_str(map, "uri", "result")?,
            title: optional_str(map, "title"),
            art: optional_str(map, "art"),
            category_id: optional_str(map, "cat_id"),
            attributes: map
                .get("attrs")
                .and_then(Variant::as_dict)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// A category descriptor shared by a group of results
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub title: String,
    pub icon: String,
    /// Opaque renderer template consumed by the display side
    pub renderer_template: String,
}

impl Category {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            icon: String::new(),
            renderer_template: String::new(),
        }
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("id".into(), Variant::from(self.id.clone()));
        map.insert("title".into(), Variant::from(self.title.clone()));
        map.insert("icon".into(), Variant::from(self.icon.clone()));
        map.insert(
            "renderer_template".into(),
            Variant::from(self.renderer_template.clone()),
        );
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            id: required_str(map, "id", "category")?,
            title: optional_str(map, "title"),
            icon: optional_str(map, "icon"),
            renderer_template: optional_str(map, "renderer_template"),
        })
    }
}

/// Per-reply category registry
///
/// Category ids are unique within one reply; registering the same id twice
/// is a logic error. Registration order is preserved.
#[derive(Debug, Default)]
pub struct CategoryRegistry {
    categories: Vec<Category>,
}

impl CategoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: Category) -> Result<()> {
        if self.lookup(&category.id).is_some() {
            return Err(MiddlewareError::Logic(format!(
                "category '{}' is already registered",
                category.id
            )));
        }
        self.categories.push(category);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// A navigation department
#[derive(Debug, Clone, PartialEq)]
pub struct Department {
    pub id: String,
    pub label: String,
    pub subdepartments: Vec<Department>,
}

impl Department {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            subdepartments: Vec::new(),
        }
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("id".into(), Variant::from(self.id.clone()));
        map.insert("label".into(), Variant::from(self.label.clone()));
        map.insert(
            "subdepartments".into(),
            Variant::Array(
                self.subdepartments
                    .iter()
                    .map(|d| Variant::Dict(d.serialize()))
                    .collect(),
            ),
        );
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        let subdepartments = map
            .get("subdepartments")
            .and_then(Variant::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Variant::as_dict)
                    .map(Department::from_variant)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            id: required_str(map, "id", "department")?,
            label: optional_str(map, "label"),
            subdepartments,
        })
    }

    /// Serialize a department list plus the currently active department id
    /// into the payload pushed on a reply channel.
    pub fn serialize_list(departments: &[Department], current_id: &str) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert(
            "departments".into(),
            Variant::Array(
                departments
                    .iter()
                    .map(|d| Variant::Dict(d.serialize()))
                    .collect(),
            ),
        );
        map.insert("current_department".into(), Variant::from(current_id));
        map
    }
}

/// A group gathering related filters
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroup {
    pub id: String,
    pub label: String,
}

impl FilterGroup {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("id".into(), Variant::from(self.id.clone()));
        map.insert("label".into(), Variant::from(self.label.clone()));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            id: required_str(map, "id", "filter group")?,
            label: optional_str(map, "label"),
        })
    }
}

/// A result filter descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub id: String,
    pub title: String,
    /// Filter kind tag, e.g. `option_selector`
    pub kind: String,
    pub group_id: String,
}

impl Filter {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind: kind.into(),
            group_id: String::new(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("id".into(), Variant::from(self.id.clone()));
        map.insert("title".into(), Variant::from(self.title.clone()));
        map.insert("kind".into(), Variant::from(self.kind.clone()));
        map.insert("group_id".into(), Variant::from(self.group_id.clone()));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            id: required_str(map, "id", "filter")?,
            title: optional_str(map, "title"),
            kind: optional_str(map, "kind"),
            group_id: optional_str(map, "group_id"),
        })
    }

    pub fn serialize_list(filters: &[Filter], groups: &[FilterGroup]) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert(
            "filters".into(),
            Variant::Array(filters.iter().map(|f| Variant::Dict(f.serialize())).collect()),
        );
        map.insert(
            "filter_groups".into(),
            Variant::Array(groups.iter().map(|g| Variant::Dict(g.serialize())).collect()),
        );
        map
    }
}

/// A query as entered (or replayed), addressed to one scope
///
/// The distinguished surfacing query has an empty query string; its results
/// are eligible for the on-disk cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CannedQuery {
    pub scope_id: String,
    pub query_string: String,
    pub department_id: String,
}

impl CannedQuery {
    pub fn new(scope_id: impl Into<String>, query_string: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            query_string: query_string.into(),
            department_id: String::new(),
        }
    }

    pub fn is_surfacing(&self) -> bool {
        self.query_string.is_empty()
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("scope_id".into(), Variant::from(self.scope_id.clone()));
        map.insert("q".into(), Variant::from(self.query_string.clone()));
        map.insert("dep_id".into(), Variant::from(self.department_id.clone()));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            scope_id: required_str(map, "scope_id", "query")?,
            query_string: optional_str(map, "q"),
            department_id: optional_str(map, "dep_id"),
        })
    }
}

/// Hints accompanying a search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMetadata {
    pub locale: String,
    pub form_factor: String,
    /// Maximum number of results the scope may push; 0 means unlimited
    pub cardinality: usize,
}

impl SearchMetadata {
    pub fn new(locale: impl Into<String>, form_factor: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            form_factor: form_factor.into(),
            cardinality: 0,
        }
    }

    pub fn with_cardinality(mut self, cardinality: usize) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("locale".into(), Variant::from(self.locale.clone()));
        map.insert("form_factor".into(), Variant::from(self.form_factor.clone()));
        map.insert("cardinality".into(), Variant::Int(self.cardinality as i64));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            locale: optional_str(map, "locale"),
            form_factor: optional_str(map, "form_factor"),
            cardinality: map
                .get("cardinality")
                .and_then(Variant::as_i64)
                .unwrap_or(0)
                .max(0) as usize,
        })
    }
}

/// Hints accompanying a preview or activation request
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMetadata {
    pub locale: String,
    pub form_factor: String,
    /// Scope-defined state carried between activation round trips
    pub scope_data: Variant,
}

impl ActionMetadata {
    pub fn new(locale: impl Into<String>, form_factor: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            form_factor: form_factor.into(),
            scope_data: Variant::Null,
        }
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("locale".into(), Variant::from(self.locale.clone()));
        map.insert("form_factor".into(), Variant::from(self.form_factor.clone()));
        map.insert("scope_data".into(), self.scope_data.clone());
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        Ok(Self {
            locale: optional_str(map, "locale"),
            form_factor: optional_str(map, "form_factor"),
            scope_data: map.get("scope_data").cloned().unwrap_or(Variant::Null),
        })
    }
}

/// What the display side should do after an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationStatus {
    NotHandled = 0,
    ShowDash = 1,
    HideDash = 2,
    ShowPreview = 3,
}

impl ActivationStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotHandled),
            1 => Some(Self::ShowDash),
            2 => Some(Self::HideDash),
            3 => Some(Self::ShowPreview),
            _ => None,
        }
    }
}

/// Outcome of an activation request
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationResponse {
    pub status: ActivationStatus,
    pub scope_data: Variant,
}

impl ActivationResponse {
    pub fn new(status: ActivationStatus) -> Self {
        Self {
            status,
            scope_data: Variant::Null,
        }
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("status".into(), Variant::Int(self.status as u8 as i64));
        map.insert("scope_data".into(), self.scope_data.clone());
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        let status = map
            .get("status")
            .and_then(Variant::as_i64)
            .and_then(|v| ActivationStatus::from_u8(v as u8))
            .ok_or_else(|| {
                MiddlewareError::Logic("activation response: missing or invalid status".into())
            })?;
        Ok(Self {
            status,
            scope_data: map.get("scope_data").cloned().unwrap_or(Variant::Null),
        })
    }
}

/// Terminal state of a reply channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Cancelled,
    Error,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Ok => "ok",
            CompletionStatus::Cancelled => "cancelled",
            CompletionStatus::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}
