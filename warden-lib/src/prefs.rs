// SPDX-License-Identifier: GPL-2.0-only
use crate::registry::traits::{RegistryError, VmRegistry};

/// Value type a preference key expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefKind {
    Bool,
    Int,
    Str,
}

impl std::fmt::Display for PrefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PrefKind::Bool => "bool",
            PrefKind::Int => "int",
            PrefKind::Str => "str",
        })
    }
}

/// The fixed preference schema. Every declarable guest attribute has a key
/// here; anything else in a request is rejected before mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefKey {
    Autostart,
    Debug,
    IncludeInBackups,
    Kernel,
    Label,
    MaxMem,
    Memory,
    ProvidesNetwork,
    NetVm,
    DefaultDispVm,
    Template,
    TemplateForDispVms,
    VCpus,
    VirtMode,
}

impl PrefKey {
    pub const ALL: [PrefKey; 14] = [
        PrefKey::Autostart,
        PrefKey::Debug,
        PrefKey::IncludeInBackups,
        PrefKey::Kernel,
        PrefKey::Label,
        PrefKey::MaxMem,
        PrefKey::Memory,
        PrefKey::ProvidesNetwork,
        PrefKey::NetVm,
        PrefKey::DefaultDispVm,
        PrefKey::Template,
        PrefKey::TemplateForDispVms,
        PrefKey::VCpus,
        PrefKey::VirtMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrefKey::Autostart => "autostart",
            PrefKey::Debug => "debug",
            PrefKey::IncludeInBackups => "include_in_backups",
            PrefKey::Kernel => "kernel",
            PrefKey::Label => "label",
            PrefKey::MaxMem => "maxmem",
            PrefKey::Memory => "memory",
            PrefKey::ProvidesNetwork => "provides_network",
            PrefKey::NetVm => "netvm",
            PrefKey::DefaultDispVm => "default_dispvm",
            PrefKey::Template => "template",
            PrefKey::TemplateForDispVms => "template_for_dispvms",
            PrefKey::VCpus => "vcpus",
            PrefKey::VirtMode => "virt_mode",
        }
    }

    pub fn kind(&self) -> PrefKind {
        match self {
            PrefKey::Autostart
            | PrefKey::Debug
            | PrefKey::IncludeInBackups
            | PrefKey::ProvidesNetwork
            | PrefKey::TemplateForDispVms => PrefKind::Bool,
            PrefKey::MaxMem | PrefKey::Memory | PrefKey::VCpus => PrefKind::Int,
            PrefKey::Kernel
            | PrefKey::Label
            | PrefKey::NetVm
            | PrefKey::DefaultDispVm
            | PrefKey::Template
            | PrefKey::VirtMode => PrefKind::Str,
        }
    }
}

impl std::fmt::Display for PrefKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PrefKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrefKey::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown preference: '{s}'"))
    }
}

/// A typed preference value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    Bool(bool),
    Int(u64),
    Str(String),
}

impl PrefValue {
    pub fn kind(&self) -> PrefKind {
        match self {
            PrefValue::Bool(_) => PrefKind::Bool,
            PrefValue::Int(_) => PrefKind::Int,
            PrefValue::Str(_) => PrefKind::Str,
        }
    }
}

/// One validated (key, value) pair from a preference request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preference {
    pub key: PrefKey,
    pub value: PrefValue,
}

/// Validation failures, all reported before any attribute is mutated.
#[derive(Debug)]
pub enum ValidationError {
    UnknownPreference(String),
    TypeMismatch { key: String, expected: PrefKind },
    MissingReference { key: String, name: String },
    CapabilityMissing { key: String, name: String },
    /// The registry itself failed while resolving a reference.
    Registry(RegistryError),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::UnknownPreference(key) => {
                write!(f, "unknown preference: {key}")
            }
            ValidationError::TypeMismatch { key, expected } => {
                write!(f, "type mismatch for '{key}': expected {expected}")
            }
            ValidationError::MissingReference { key, name } => {
                write!(f, "missing reference for '{key}': no guest named '{name}'")
            }
            ValidationError::CapabilityMissing { key, name } => {
                write!(f, "capability missing for '{key}': guest '{name}' does not qualify")
            }
            ValidationError::Registry(e) => {
                write!(f, "registry error during validation: {e}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<RegistryError> for ValidationError {
    fn from(e: RegistryError) -> Self {
        ValidationError::Registry(e)
    }
}

/// Parse raw (name, JSON value) pairs into typed preferences.
///
/// Fails on the first key absent from the schema or the first value whose
/// dynamic type disagrees with it. Nothing is applied on failure.
pub fn parse_request<'a, I>(raw: I) -> Result<Vec<Preference>, ValidationError>
where
    I: IntoIterator<Item = (&'a str, &'a serde_json::Value)>,
{
    let mut prefs = Vec::new();
    for (name, value) in raw {
        let key: PrefKey = name
            .parse()
            .map_err(|_| ValidationError::UnknownPreference(name.to_string()))?;
        let mismatch = || ValidationError::TypeMismatch {
            key: name.to_string(),
            expected: key.kind(),
        };
        let value = match key.kind() {
            PrefKind::Bool => PrefValue::Bool(value.as_bool().ok_or_else(mismatch)?),
            PrefKind::Int => PrefValue::Int(value.as_u64().ok_or_else(mismatch)?),
            PrefKind::Str => PrefValue::Str(value.as_str().ok_or_else(mismatch)?.to_string()),
        };
        prefs.push(Preference { key, value });
    }
    Ok(prefs)
}

/// Cross-referential checks against a registry snapshot. Pure read; designed
/// to run to completion before the reconciler mutates anything.
///
/// A non-empty `netvm` must name an existing guest with
/// `provides_network = true`; a non-empty `default_dispvm` must name an
/// existing guest with `template_for_dispvms = true`.
pub fn validate(prefs: &[Preference], registry: &dyn VmRegistry) -> Result<(), ValidationError> {
    for pref in prefs {
        let capability = match pref.key {
            PrefKey::NetVm => PrefKey::ProvidesNetwork,
            PrefKey::DefaultDispVm => PrefKey::TemplateForDispVms,
            _ => continue,
        };
        let target = match &pref.value {
            PrefValue::Str(name) if !name.is_empty() => name,
            _ => continue,
        };
        let handle = match registry.lookup(target) {
            Ok(handle) => handle,
            Err(RegistryError::NotFound(_)) => {
                return Err(ValidationError::MissingReference {
                    key: pref.key.as_str().to_string(),
                    name: target.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        match handle.get_pref(capability)? {
            PrefValue::Bool(true) => {}
            PrefValue::Bool(false) => {
                return Err(ValidationError::CapabilityMissing {
                    key: pref.key.as_str().to_string(),
                    name: target.clone(),
                })
            }
            other => {
                return Err(ValidationError::Registry(RegistryError::Backend(format!(
                    "expected bool for {}, got {:?}",
                    capability.as_str(),
                    other
                ))))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::traits::{CreateGuestParams, VmRegistry};
    use crate::vm::VmClass;
    use serde_json::json;

    fn params(name: &str) -> CreateGuestParams {
        CreateGuestParams {
            name: name.to_string(),
            class: VmClass::AppVM,
            label: "red".to_string(),
            template: None,
        }
    }

    #[test]
    fn every_key_parses_back() {
        for key in PrefKey::ALL {
            assert_eq!(key.as_str().parse::<PrefKey>().unwrap(), key);
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        let raw = [("colour".to_string(), json!("red"))];
        let err = parse_request(raw.iter().map(|(k, v)| (k.as_str(), v))).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownPreference(k) if k == "colour"));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let raw = [("memory".to_string(), json!("lots"))];
        let err = parse_request(raw.iter().map(|(k, v)| (k.as_str(), v))).unwrap_err();
        match err {
            ValidationError::TypeMismatch { key, expected } => {
                assert_eq!(key, "memory");
                assert_eq!(expected, PrefKind::Int);
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn typed_values_come_through() {
        let raw = [
            ("autostart".to_string(), json!(true)),
            ("vcpus".to_string(), json!(4)),
            ("kernel".to_string(), json!("6.6.2")),
        ];
        let prefs = parse_request(raw.iter().map(|(k, v)| (k.as_str(), v))).unwrap();
        assert_eq!(prefs[0].value, PrefValue::Bool(true));
        assert_eq!(prefs[1].value, PrefValue::Int(4));
        assert_eq!(prefs[2].value, PrefValue::Str("6.6.2".to_string()));
    }

    #[test]
    fn netvm_must_exist() {
        let registry = MemoryRegistry::new();
        let prefs = vec![Preference {
            key: PrefKey::NetVm,
            value: PrefValue::Str("sys-net".to_string()),
        }];
        let err = validate(&prefs, &registry).unwrap_err();
        assert!(matches!(err, ValidationError::MissingReference { key, name }
            if key == "netvm" && name == "sys-net"));
    }

    #[test]
    fn netvm_must_provide_network() {
        let registry = MemoryRegistry::new();
        registry.create_handle(&params("sys-net")).unwrap();
        let prefs = vec![Preference {
            key: PrefKey::NetVm,
            value: PrefValue::Str("sys-net".to_string()),
        }];
        let err = validate(&prefs, &registry).unwrap_err();
        assert!(matches!(err, ValidationError::CapabilityMissing { key, name }
            if key == "netvm" && name == "sys-net"));
    }

    #[test]
    fn qualified_netvm_passes() {
        let registry = MemoryRegistry::new();
        let handle = registry.create_handle(&params("sys-net")).unwrap();
        handle
            .set_pref(&Preference {
                key: PrefKey::ProvidesNetwork,
                value: PrefValue::Bool(true),
            })
            .unwrap();
        let prefs = vec![Preference {
            key: PrefKey::NetVm,
            value: PrefValue::Str("sys-net".to_string()),
        }];
        assert!(validate(&prefs, &registry).is_ok());
    }

    #[test]
    fn empty_netvm_skips_reference_check() {
        let registry = MemoryRegistry::new();
        let prefs = vec![Preference {
            key: PrefKey::NetVm,
            value: PrefValue::Str(String::new()),
        }];
        assert!(validate(&prefs, &registry).is_ok());
    }

    #[test]
    fn dispvm_template_capability_is_gated() {
        let registry = MemoryRegistry::new();
        registry.create_handle(&params("dvm")).unwrap();
        let prefs = vec![Preference {
            key: PrefKey::DefaultDispVm,
            value: PrefValue::Str("dvm".to_string()),
        }];
        let err = validate(&prefs, &registry).unwrap_err();
        assert!(matches!(err, ValidationError::CapabilityMissing { key, .. }
            if key == "default_dispvm"));
    }

    #[test]
    fn non_reference_prefs_do_not_touch_registry() {
        // No guests at all; plain attribute prefs still validate.
        let registry = MemoryRegistry::new();
        let raw = [("memory".to_string(), json!(512))];
        let prefs = parse_request(raw.iter().map(|(k, v)| (k.as_str(), v))).unwrap();
        assert!(validate(&prefs, &registry).is_ok());
    }
}
