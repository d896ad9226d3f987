//! Device-driver domain model.
//!
//! A driver role file names, per module, which concrete function implements
//! each asynchronous entry-point role:
//!
//! ```text
//! <test_module>
//! probe::drv_init
//! irq::drv_irq
//! </>
//! ```
//!
//! Exactly one `probe` role must exist; it is the init entry point and runs
//! exactly once, non-concurrently, before every other entry point.

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverInfoError {
    #[error("driver info line '{line}' is not of the form 'role::function'")]
    MalformedLine { line: String },
    #[error("module section '{module}' is missing its '</>' end marker")]
    UnterminatedModule { module: String },
    #[error("no entry point with role 'probe' was declared")]
    MissingProbeRole,
    #[error("entry point '{name}' is declared more than once")]
    DuplicateEntryPoint { name: String },
}

/// One asynchronous entry point of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Concrete function name in the lowered program.
    pub name: String,
    /// Kernel role tag from the driver info file (`probe`, `irq`, ...).
    pub kernel_func: String,
    /// Module section the entry point was declared in.
    pub module: String,
    pub is_init: bool,
    /// Serialized by the kernel via `device_lock(dev)`.
    pub is_device_locked: bool,
    /// Serialized by the RTNL lock.
    pub is_rtnl_locked: bool,
    /// Region name -> read access count; entries drop to zero under slicing.
    pub read_accesses: IndexMap<String, usize>,
    /// Region name -> write access count.
    pub write_accesses: IndexMap<String, usize>,
}

impl EntryPoint {
    fn new(name: &str, kernel_func: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            kernel_func: kernel_func.to_string(),
            module: module.to_string(),
            is_init: kernel_func == "probe",
            is_device_locked: has_kernel_imposed_device_lock(kernel_func),
            is_rtnl_locked: has_kernel_imposed_rtnl(kernel_func),
            read_accesses: IndexMap::new(),
            write_accesses: IndexMap::new(),
        }
    }
}

/// The entry point has been serialized by the kernel using `device_lock`.
pub fn has_kernel_imposed_device_lock(role: &str) -> bool {
    // pci driver API
    matches!(role, "probe" | "remove" | "shutdown")
        // power management API
        || matches!(role, "prepare" | "complete" | "resume" | "suspend")
}

/// The entry point has been serialized by RTNL.
pub fn has_kernel_imposed_rtnl(role: &str) -> bool {
    // network device management API
    matches!(role, "ndo_open" | "ndo_stop")
        // ethernet device management API
        || matches!(role, "get_settings" | "get_ethtool_stats")
}

/// Parsed driver role information: the entry points and the init routine.
#[derive(Debug, Clone)]
pub struct DeviceDriver {
    pub entry_points: Vec<EntryPoint>,
    init: String,
}

impl DeviceDriver {
    /// Parse a driver info file.
    pub fn parse(text: &str) -> Result<Self, DriverInfoError> {
        let mut entry_points: Vec<EntryPoint> = Vec::new();
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        while let Some(header) = lines.next() {
            let module = header.trim_matches(|c| c == '<' || c == '>').to_string();
            let mut terminated = false;
            for line in lines.by_ref() {
                if line == "</>" {
                    terminated = true;
                    break;
                }
                let (role, func) =
                    line.split_once("::")
                        .ok_or_else(|| DriverInfoError::MalformedLine {
                            line: line.to_string(),
                        })?;
                if entry_points.iter().any(|ep| ep.name == func) {
                    return Err(DriverInfoError::DuplicateEntryPoint {
                        name: func.to_string(),
                    });
                }
                entry_points.push(EntryPoint::new(func, role, &module));
            }
            if !terminated {
                return Err(DriverInfoError::UnterminatedModule { module });
            }
        }

        let init = entry_points
            .iter()
            .find(|ep| ep.is_init)
            .map(|ep| ep.name.clone())
            .ok_or(DriverInfoError::MissingProbeRole)?;

        Ok(Self { entry_points, init })
    }

    /// Name of the init (probe) entry point.
    pub fn init_entry_point(&self) -> &str {
        &self.init
    }

    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|ep| ep.name == name)
    }

    pub fn entry_point_mut(&mut self, name: &str) -> Option<&mut EntryPoint> {
        self.entry_points.iter_mut().find(|ep| ep.name == name)
    }

    /// Entry points that participate in pairing (everything but init).
    pub fn concurrent_entry_points(&self) -> impl Iterator<Item = &EntryPoint> {
        self.entry_points.iter().filter(|ep| !ep.is_init)
    }

    /// Whether two roles may interleave. The init routine runs exactly once,
    /// non-concurrently; two entry points serialized by the same kernel lock
    /// never interleave either.
    pub fn can_run_concurrently(role1: &str, role2: &str) -> bool {
        if role1 == "probe" || role2 == "probe" {
            return false;
        }
        if has_kernel_imposed_device_lock(role1) && has_kernel_imposed_device_lock(role2) {
            return false;
        }
        if has_kernel_imposed_rtnl(role1) && has_kernel_imposed_rtnl(role2) {
            return false;
        }
        true
    }
}
