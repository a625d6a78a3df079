pub mod artifact;
pub mod browser;
pub mod cookies;
pub mod error;
pub mod flow;
pub mod server;
pub mod session;

//  Re-export commonly used items
pub use artifact::ArtifactRelay;
pub use browser::chrome::{ChromeDriver, ChromePage, ConnectionMode};
pub use browser::page::{FrameId, FrameNode, PageCookie, PageHandle};
pub use error::{FlowError, Result};
pub use flow::{
    ChallengeOutcome, Completion, CompletionPoller, ControlDescriptor, FlowConfig, FrameProbe,
    InputKind, LoginFlow, MarkupProfile, Stage,
};
pub use session::{Session, SessionRegistry};
