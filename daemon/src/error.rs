use meridian_rs::machine::MachineState;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("machine {0:?} already exists")]
    AlreadyExists(String),

    #[error("machine {0:?} not found")]
    NotFound(String),

    #[error("machine {name:?} is {state}, cannot {op}")]
    InvalidTransition {
        name: String,
        state: MachineState,
        op: &'static str,
    },

    #[error("machine {0:?} is still initializing")]
    Initializing(String),

    #[error("machine {0:?} is protected")]
    Protected(String),

    #[error("invalid machine spec: {0:#}")]
    InvalidSpec(anyhow::Error),

    #[error("image {0:?} not found")]
    UnknownImage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VmError {
    pub fn invalid_transition(name: &str, state: MachineState, op: &'static str) -> Self {
        VmError::InvalidTransition {
            name: name.to_string(),
            state,
            op,
        }
    }
}
