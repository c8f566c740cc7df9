//! 脚本运行时：状态机、能力集、生命周期监管

pub mod builtin;
mod context;
mod machine;
mod supervisor;
mod traits;

pub use builtin::{register_builtin, scroll_read, ScrollRead, ScrollReadState, SCROLL_READ};
pub use context::ScriptContext;
pub use machine::{MachineConfig, MachineScript, ScriptState, StateHandler, StateMachine};
pub use supervisor::{ScriptSupervisor, SupervisorConfig};
pub use traits::{Script, ScriptFactory, ScriptRegistry, StepOutcome};
