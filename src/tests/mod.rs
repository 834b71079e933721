//! Cross-service tests wiring the gateway, producer and consumer together.
