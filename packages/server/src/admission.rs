//! Admission policies checked before a task is dispatched.
//!
//! Pure decision logic: the caller supplies the owner's current monthly
//! spend, so the policy itself touches no storage and tests need no
//! database.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use batch_core::render;
use llm_client::PricingTable;

lazy_static! {
    // Coarse deny-list for clearly out-of-policy templates. Heuristic by
    // design; the provider's own moderation is the real backstop.
    static ref MODERATION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bhow\s+to\s+(?:build|make)\s+(?:a\s+)?(?:bomb|explosive|weapon)").unwrap(),
        Regex::new(r"(?i)\bsynthesi[sz]e\s+(?:meth|fentanyl|nerve\s+agent)").unwrap(),
        Regex::new(r"(?i)\bgenerate\s+(?:csam|child\s+sexual)").unwrap(),
        Regex::new(r"(?i)\bcredit\s+card\s+numbers?\s+(?:generator|list)").unwrap(),
    ];
}

/// Why a job was refused admission.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DenyReason {
    #[error("model `{0}` is not in the allowed set")]
    DisallowedModel(String),

    #[error("template rejected by content moderation")]
    Moderation,

    #[error("template contains prompt-injection phrasing")]
    PromptInjection,

    #[error("estimated cost ${estimated:.2} exceeds remaining monthly budget ${remaining:.2}")]
    OverBudget { estimated: f64, remaining: f64 },

    #[error("job size {units} exceeds the limit of {limit} units")]
    OversizedJob { units: i64, limit: i64 },
}

/// Policy configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    allowed_models: HashSet<String>,
    moderation_enabled: bool,
    budget_enforcement: bool,
    monthly_budget_usd: f64,
    max_units: i64,
    pricing: PricingTable,
    /// Prompt-token guess per unit for the cost preflight.
    prompt_tokens_guess: u32,
}

impl AdmissionPolicy {
    pub fn new(
        allowed_models: HashSet<String>,
        moderation_enabled: bool,
        budget_enforcement: bool,
        monthly_budget_usd: f64,
        max_units: i64,
    ) -> Self {
        Self {
            allowed_models,
            moderation_enabled,
            budget_enforcement,
            monthly_budget_usd,
            max_units,
            pricing: PricingTable::default(),
            prompt_tokens_guess: 500,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Cheap cost preflight for `est_units` units of `model`.
    pub fn estimated_cost(&self, model: &str, est_units: i64, max_tokens: u32) -> f64 {
        let per_unit = self
            .pricing
            .cost(model, self.prompt_tokens_guess, max_tokens)
            .unwrap_or(0.0);
        per_unit * est_units.max(0) as f64
    }

    /// Budget-only preflight: would `est_units` of `model` fit in what
    /// remains of the monthly budget?
    pub fn within_budget(
        &self,
        model: &str,
        est_units: i64,
        max_tokens: u32,
        current_month_spend: f64,
    ) -> bool {
        if !self.budget_enforcement {
            return true;
        }
        let remaining = self.monthly_budget_usd - current_month_spend;
        self.estimated_cost(model, est_units, max_tokens) <= remaining
    }

    /// Admit or deny a job before dispatch.
    ///
    /// `declared_limit` is the job's own unit bound, when it carries one;
    /// the effective size cap is the tighter of it and the global cap.
    /// `current_month_spend` is the owner's ledger sum for the calendar
    /// month, fetched by the caller.
    pub fn admit(
        &self,
        model: &str,
        template: &str,
        est_units: i64,
        max_tokens: u32,
        declared_limit: Option<i64>,
        current_month_spend: f64,
    ) -> Result<(), DenyReason> {
        if !self.allowed_models.contains(model) {
            return Err(DenyReason::DisallowedModel(model.to_string()));
        }

        let limit = declared_limit.map_or(self.max_units, |l| l.min(self.max_units));
        if est_units > limit {
            return Err(DenyReason::OversizedJob {
                units: est_units,
                limit,
            });
        }

        if self.moderation_enabled {
            if MODERATION_PATTERNS.iter().any(|p| p.is_match(template)) {
                return Err(DenyReason::Moderation);
            }
            if render::scrub_injection(template) != template {
                return Err(DenyReason::PromptInjection);
            }
        }

        if !self.within_budget(model, est_units, max_tokens, current_month_spend) {
            return Err(DenyReason::OverBudget {
                estimated: self.estimated_cost(model, est_units, max_tokens),
                remaining: self.monthly_budget_usd - current_month_spend,
            });
        }

        Ok(())
    }
}
