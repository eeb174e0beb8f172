// Processor environment: static env decorator and per-message env
use super::worker::constants::{HEADER_ENV_PREFIX, QUEUE_ENV_KEY, REDELIVERED_ENV_KEY};
use crate::domain::Message;
use crate::port::{Env, InvocationContext, Processor, ProcessorOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Fill keys missing from `env` with entries from `extra`; present keys win
pub fn merge_env(mut env: Env, extra: &Env) -> Env {
    for (key, value) in extra {
        env.entry(key.clone()).or_insert_with(|| value.clone());
    }
    env
}

/// Decorator adding static environment entries to every invocation
///
/// Stateless apart from the immutable `extra` map, so one instance is shared by
/// all workers of a queue.
pub struct ProcessorWithEnv {
    inner: Arc<dyn Processor>,
    extra: Env,
}

impl ProcessorWithEnv {
    pub fn new(inner: Arc<dyn Processor>, extra: Env) -> Self {
        Self { inner, extra }
    }
}

#[async_trait]
impl Processor for ProcessorWithEnv {
    async fn process(&self, ctx: &InvocationContext, env: Env, payload: Bytes) -> ProcessorOutcome {
        self.inner
            .process(ctx, merge_env(env, &self.extra), payload)
            .await
    }
}

/// Wrap `base` so its invocations also see `extra`
pub fn with_env(base: Arc<dyn Processor>, extra: Env) -> Arc<dyn Processor> {
    Arc::new(ProcessorWithEnv::new(base, extra))
}

/// Environment a worker hands to the processor for one message
///
/// Scalar headers become `HTTP_<NAME>` (upper-case, `-` → `_`), plus the queue
/// name and the broker's redelivery flag.
pub fn message_env(queue: &str, message: &Message) -> Env {
    let mut env: Env = message
        .headers
        .iter()
        .map(|(name, value)| (header_env_key(name), value.clone()))
        .collect();
    env.insert(QUEUE_ENV_KEY.to_string(), queue.to_string());
    env.insert(
        REDELIVERED_ENV_KEY.to_string(),
        if message.redelivered { "1" } else { "0" }.to_string(),
    );
    env
}

fn header_env_key(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}{}", HEADER_ENV_PREFIX, normalized)
}
