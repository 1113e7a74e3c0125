pub mod codec;
pub mod content;
pub mod coordinator;
pub mod jobs;
pub mod policy;
pub mod publisher;
pub mod source_api;
pub mod store;
pub mod throttle;
pub mod usernames;

pub use codec::{CodecError, CodecKeys};
pub use content::ContentGenerator;
pub use coordinator::{PublishCoordinator, PublishPipeline};
pub use policy::AccessPolicyEngine;
pub use publisher::{ArtifactPublisher, GitDataPublisher, MockPublisher};
pub use source_api::{HttpUserLookup, MockUserLookup, UserLookup};
pub use store::{AccessStore, InMemoryStore, MongoStore};
pub use throttle::ThrottledClient;
pub use usernames::UsernameResolver;
