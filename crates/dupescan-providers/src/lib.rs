pub mod chat;
pub mod embedding;
pub mod ratelimit;
pub mod source_host;

pub use chat::{ChatProvider, ChatResponse, FakeChatProvider, HostedChatProvider};
pub use embedding::{EmbeddingProvider, FakeEmbeddingProvider, HostedEmbeddingProvider};
pub use ratelimit::RateLimiter;
pub use source_host::{
    FakeRemotePr, FakeSourceHost, GithubSourceHost, RemotePr, SourceHost, SourceHostError,
};
