//! Child process management.
//!
//! Background processes are placed in their own process group so that
//! termination reaches anything they spawned. Foreground processes stay in
//! the launcher's group and keep the terminal.

mod group;

pub use group::{
    ManagedChild, ProcessError, SpawnMode, Termination, build_command, exit_code_of, group_alive,
    spawn, terminate_detached_group,
};
