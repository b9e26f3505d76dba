//! The voice interaction pipeline: state machine, transient context, and
//! the orchestrator that wires every collaborator together.

pub mod context;
pub mod messages;
pub mod orchestrator;
pub mod state;

pub use messages::Utterance;
pub use orchestrator::{PipelineDeps, PipelineHandle, VoicePipeline};
pub use state::{
    NewPostStep, PipelineEvent, PipelineState, StateMachine, StateType, TransitionEffect,
};
