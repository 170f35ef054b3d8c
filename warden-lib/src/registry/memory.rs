// SPDX-License-Identifier: GPL-2.0-only
use crate::prefs::{PrefKey, PrefValue, Preference};
use crate::registry::traits::{CreateGuestParams, RegistryError, VmHandle, VmRegistry};
use crate::vm::{VmClass, VmState};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything the registry tracks about one guest.
#[derive(Debug, Clone)]
struct GuestRecord {
    class: VmClass,
    state: VmState,
    autostart: bool,
    debug: bool,
    include_in_backups: bool,
    kernel: String,
    label: String,
    maxmem: u64,
    memory: u64,
    provides_network: bool,
    netvm: String,
    default_dispvm: String,
    template: String,
    template_for_dispvms: bool,
    vcpus: u64,
    virt_mode: String,
}

impl GuestRecord {
    fn new(params: &CreateGuestParams) -> Self {
        GuestRecord {
            class: params.class,
            state: VmState::Shutdown,
            autostart: false,
            debug: false,
            include_in_backups: true,
            kernel: String::new(),
            label: params.label.clone(),
            maxmem: 4000,
            memory: 400,
            provides_network: false,
            netvm: String::new(),
            default_dispvm: String::new(),
            template: params.template.clone().unwrap_or_default(),
            template_for_dispvms: false,
            vcpus: 2,
            virt_mode: "pvh".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    guests: BTreeMap<String, GuestRecord>,
    default_netvm: Option<String>,
}

/// Hermetic registry backend.
///
/// Implements the full registry surface against an in-process table, with
/// the same probe and failure semantics the external manager exhibits
/// (`NotStarted` on stopping an already-halted guest included). Used by the
/// test suites and by `wardenctl --backend memory`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the privileged administrative domain, which listings exclude.
    pub fn with_admin_domain(self, name: &str) -> Self {
        {
            let mut inner = self.lock();
            let mut record = GuestRecord::new(&CreateGuestParams {
                name: name.to_string(),
                class: VmClass::AdminVM,
                label: "black".to_string(),
                template: None,
            });
            record.state = VmState::Running;
            inner.guests.insert(name.to_string(), record);
        }
        self
    }

    pub fn set_default_netvm(&self, name: Option<&str>) {
        self.lock().default_netvm = name.map(str::to_string);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }
}

impl VmRegistry for MemoryRegistry {
    fn list_handles(&self) -> Result<Vec<Box<dyn VmHandle + '_>>, RegistryError> {
        let names: Vec<String> = self.lock().guests.keys().cloned().collect();
        Ok(names
            .into_iter()
            .map(|name| {
                Box::new(MemoryHandle {
                    name,
                    inner: Arc::clone(&self.inner),
                }) as Box<dyn VmHandle>
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Box<dyn VmHandle + '_>, RegistryError> {
        if !self.lock().guests.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(Box::new(MemoryHandle {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn create_handle(
        &self,
        params: &CreateGuestParams,
    ) -> Result<Box<dyn VmHandle + '_>, RegistryError> {
        params.validate().map_err(RegistryError::Backend)?;
        {
            let mut inner = self.lock();
            if inner.guests.contains_key(&params.name) {
                return Err(RegistryError::AlreadyExists(params.name.clone()));
            }
            inner
                .guests
                .insert(params.name.clone(), GuestRecord::new(params));
        }
        self.lookup(&params.name)
    }

    fn delete_handle(&self, name: &str) -> Result<(), RegistryError> {
        match self.lock().guests.remove(name) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    fn default_netvm(&self) -> Result<Option<String>, RegistryError> {
        Ok(self.lock().default_netvm.clone())
    }
}

#[derive(Debug)]
struct MemoryHandle {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHandle {
    fn with_record<T>(
        &self,
        f: impl FnOnce(&mut GuestRecord) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.guests.get_mut(&self.name) {
            Some(record) => f(record),
            None => Err(RegistryError::NotFound(self.name.clone())),
        }
    }
}

impl VmHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> Result<VmClass, RegistryError> {
        self.with_record(|r| Ok(r.class))
    }

    fn is_paused(&self) -> Result<bool, RegistryError> {
        self.with_record(|r| Ok(r.state == VmState::Paused))
    }

    fn is_running(&self) -> Result<bool, RegistryError> {
        self.with_record(|r| Ok(r.state == VmState::Running))
    }

    fn is_halted(&self) -> Result<bool, RegistryError> {
        self.with_record(|r| Ok(r.state == VmState::Shutdown))
    }

    fn start(&self) -> Result<(), RegistryError> {
        self.with_record(|r| match r.state {
            VmState::Running | VmState::Paused => Err(RegistryError::Backend(format!(
                "guest '{}' is not halted",
                self.name
            ))),
            _ => {
                r.state = VmState::Running;
                Ok(())
            }
        })
    }

    fn pause(&self) -> Result<(), RegistryError> {
        self.with_record(|r| match r.state {
            VmState::Running => {
                r.state = VmState::Paused;
                Ok(())
            }
            _ => Err(RegistryError::Backend(format!(
                "guest '{}' is not running",
                self.name
            ))),
        })
    }

    fn unpause(&self) -> Result<(), RegistryError> {
        self.with_record(|r| match r.state {
            VmState::Paused => {
                r.state = VmState::Running;
                Ok(())
            }
            _ => Err(RegistryError::Backend(format!(
                "guest '{}' is not paused",
                self.name
            ))),
        })
    }

    fn shutdown(&self) -> Result<(), RegistryError> {
        self.with_record(|r| match r.state {
            VmState::Running | VmState::Paused => {
                r.state = VmState::Shutdown;
                Ok(())
            }
            _ => Err(RegistryError::NotStarted(self.name.clone())),
        })
    }

    fn force_shutdown(&self) -> Result<(), RegistryError> {
        self.with_record(|r| match r.state {
            VmState::Running | VmState::Paused => {
                r.state = VmState::Shutdown;
                Ok(())
            }
            _ => Err(RegistryError::NotStarted(self.name.clone())),
        })
    }

    fn get_pref(&self, key: PrefKey) -> Result<PrefValue, RegistryError> {
        self.with_record(|r| {
            Ok(match key {
                PrefKey::Autostart => PrefValue::Bool(r.autostart),
                PrefKey::Debug => PrefValue::Bool(r.debug),
                PrefKey::IncludeInBackups => PrefValue::Bool(r.include_in_backups),
                PrefKey::Kernel => PrefValue::Str(r.kernel.clone()),
                PrefKey::Label => PrefValue::Str(r.label.clone()),
                PrefKey::MaxMem => PrefValue::Int(r.maxmem),
                PrefKey::Memory => PrefValue::Int(r.memory),
                PrefKey::ProvidesNetwork => PrefValue::Bool(r.provides_network),
                PrefKey::NetVm => PrefValue::Str(r.netvm.clone()),
                PrefKey::DefaultDispVm => PrefValue::Str(r.default_dispvm.clone()),
                PrefKey::Template => PrefValue::Str(r.template.clone()),
                PrefKey::TemplateForDispVms => PrefValue::Bool(r.template_for_dispvms),
                PrefKey::VCpus => PrefValue::Int(r.vcpus),
                PrefKey::VirtMode => PrefValue::Str(r.virt_mode.clone()),
            })
        })
    }

    fn set_pref(&self, pref: &Preference) -> Result<(), RegistryError> {
        self.with_record(|r| {
            match (&pref.key, &pref.value) {
                (PrefKey::Autostart, PrefValue::Bool(v)) => r.autostart = *v,
                (PrefKey::Debug, PrefValue::Bool(v)) => r.debug = *v,
                (PrefKey::IncludeInBackups, PrefValue::Bool(v)) => r.include_in_backups = *v,
                (PrefKey::Kernel, PrefValue::Str(v)) => r.kernel = v.clone(),
                (PrefKey::Label, PrefValue::Str(v)) => r.label = v.clone(),
                (PrefKey::MaxMem, PrefValue::Int(v)) => r.maxmem = *v,
                (PrefKey::Memory, PrefValue::Int(v)) => r.memory = *v,
                (PrefKey::ProvidesNetwork, PrefValue::Bool(v)) => r.provides_network = *v,
                (PrefKey::NetVm, PrefValue::Str(v)) => r.netvm = v.clone(),
                (PrefKey::DefaultDispVm, PrefValue::Str(v)) => r.default_dispvm = v.clone(),
                (PrefKey::Template, PrefValue::Str(v)) => r.template = v.clone(),
                (PrefKey::TemplateForDispVms, PrefValue::Bool(v)) => r.template_for_dispvms = *v,
                (PrefKey::VCpus, PrefValue::Int(v)) => r.vcpus = *v,
                (PrefKey::VirtMode, PrefValue::Str(v)) => r.virt_mode = v.clone(),
                (key, value) => {
                    return Err(RegistryError::Backend(format!(
                        "value {:?} does not fit preference '{}'",
                        value,
                        key.as_str()
                    )))
                }
            }
            Ok(())
        })
    }
}
