pub mod host;
pub mod invalidator;
pub mod orchestrator;
pub mod registry;

pub use host::{
    DigestModuleLoader, HeadlessHost, MarkupLoader, ModuleLoader, NativeProcess, ProcessControl,
    UiHost,
};
pub use invalidator::{path_to_module, ModuleInvalidator, ReloadOutcome, MODULE_RELOAD_PASSES};
pub use orchestrator::{classify, Orchestrator, Phase, ReloadAction, ReloadRules, ServiceSpec};
pub use registry::{FactoryRegistry, LoadedModule, MemoryModuleTable, ModuleTable, RuntimeRegistry};
