pub mod frames;
pub mod machine;
pub mod matchers;
pub mod poller;

pub use frames::{search_shallow, search_tree, FrameProbe};
pub use machine::{
    ChallengeOutcome, ControlDescriptor, FlowConfig, InputKind, LoginFlow, Stage,
};
pub use matchers::{JsProbe, MarkupProfile, IDENTITY_STRING};
pub use poller::{Completion, CompletionPoller};
