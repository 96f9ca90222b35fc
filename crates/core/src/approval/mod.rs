//! Human-decision checkpoints between pipeline stages.

mod gate;
mod types;

pub use gate::ApprovalGate;
pub use types::{
    Approval, ApprovalDecision, ApprovalError, ApprovalReply, ApprovalResponse, ApprovalSpec,
    ApprovalStatus,
};
