// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-process engine state.
//!
//! Everything the balancer carries across iterations lives here, passed
//! explicitly through each call: the validated configuration, the normalized
//! balancing rules, the calm-iteration counter feeding the detector's
//! threshold perturbation, and the random source behind the perturbation
//! draw. There is no process-wide mutable state.

use crate::snapshot::ClusterRules;
use pvelb_config::Config;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// State that survives from one control-loop iteration to the next.
#[derive(Debug)]
pub struct EngineContext {
    /// The validated configuration.
    pub config: Config,
    /// Exclusion sets and group mapping, normalized once at startup.
    pub rules: ClusterRules,
    /// Consecutive iterations in which no balancing was performed.
    pub calm_iterations: u32,
    /// Random source for the detector's threshold perturbation.
    pub rng: SmallRng,
}

impl EngineContext {
    /// Builds a context from a validated configuration, seeding the random
    /// source from the wall clock.
    pub fn new(config: Config) -> Result<Self, pvelb_config::Error> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::with_seed(config, seed)
    }

    /// Builds a context with a caller-chosen random seed. Tests use this to
    /// make the perturbation draw reproducible.
    pub fn with_seed(config: Config, seed: u64) -> Result<Self, pvelb_config::Error> {
        let rules = ClusterRules::from_config(&config)?;
        Ok(EngineContext {
            rules,
            calm_iterations: 0,
            rng: SmallRng::seed_from_u64(seed),
            config,
        })
    }
}
