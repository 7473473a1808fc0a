// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges of the routing topology. Both the primary and
//! the dead-letter exchange are durable direct exchanges.

/// Definition of a RabbitMQ direct exchange.
///
/// Built with chained setters; a fresh definition is non-durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub(crate) fn kind(&self) -> lapin::ExchangeKind {
        lapin::ExchangeKind::Direct
    }

    pub(crate) fn declare_options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_direct_exchange() {
        let def = ExchangeDefinition::new("normal_exchange").durable();
        let opts = def.declare_options();

        assert_eq!(def.name, "normal_exchange");
        assert_eq!(def.kind(), lapin::ExchangeKind::Direct);
        assert!(opts.durable);
        assert!(!opts.auto_delete);
        assert!(!opts.nowait);
    }

    #[test]
    fn test_fresh_exchange_is_transient() {
        let opts = ExchangeDefinition::new("scratch").declare_options();
        assert!(!opts.durable);
        assert!(!opts.passive);
    }
}
