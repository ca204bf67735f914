//! Computes a numeric priority and class from log text, service metadata,
//! time, and history (C4, `spec.md` §4.4).

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{Alert, PriorityClass, ServiceDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub keyword: f64,
    pub service: f64,
    pub time: f64,
    pub history: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            keyword: 0.3,
            service: 0.4,
            time: 0.2,
            history: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeywordRules {
    pub critical: Vec<Regex>,
    pub high: Vec<Regex>,
    pub medium: Vec<Regex>,
}

/// Patterns with nested quantifiers (e.g. `(a+)+`) risk catastrophic
/// backtracking and are rejected at config load, per `spec.md` §4.4.
fn is_unsafe_pattern(pattern: &str) -> bool {
    let nested_quantifier = Regex::new(r"\([^)]*[+*][^)]*\)[+*]").unwrap();
    nested_quantifier.is_match(pattern)
}

impl KeywordRules {
    pub fn compile(
        critical: &[String],
        high: &[String],
        medium: &[String],
    ) -> Result<Self, ConfigError> {
        let compile_set = |patterns: &[String]| -> Result<Vec<Regex>, ConfigError> {
            patterns
                .iter()
                .map(|p| {
                    if is_unsafe_pattern(p) {
                        return Err(ConfigError::UnsafeRegex {
                            pattern: p.clone(),
                        });
                    }
                    Regex::new(&format!("(?i){}", regex::escape(p)))
                        .or_else(|_| Regex::new(&format!("(?i){p}")))
                        .map_err(|e| ConfigError::InvalidValue {
                            key: "priorityQueue.keywords".into(),
                            reason: e.to_string(),
                        })
                })
                .collect()
        };
        Ok(Self {
            critical: compile_set(critical)?,
            high: compile_set(high)?,
            medium: compile_set(medium)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub peak_start_hour: Option<u32>,
    pub peak_end_hour: Option<u32>,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            peak_start_hour: None,
            peak_end_hour: None,
        }
    }
}

pub struct PriorityCalculator {
    pub weights: PriorityWeights,
    pub keywords: KeywordRules,
    pub services: Vec<ServiceDescriptor>,
    pub business_hours: BusinessHours,
}

impl PriorityCalculator {
    /// Pure scoring function: `numeric = w_k*keyword + w_s*service +
    /// w_t*time + w_h*history`, classified per `spec.md` §4.4's thresholds.
    pub fn score(&self, alert: &Alert, now: chrono::DateTime<chrono::Utc>, history_frequency: f64) -> (PriorityClass, f64) {
        let keyword = self.keyword_score(alert);
        let service = self.service_score(alert);
        let time = self.time_score(now);
        let history = history_frequency.clamp(0.0, 1.0);

        let numeric = self.weights.keyword * keyword
            + self.weights.service * service
            + self.weights.time * time
            + self.weights.history * history;

        (PriorityClass::from_score(numeric), numeric)
    }

    fn keyword_score(&self, alert: &Alert) -> f64 {
        let haystack = format!("{} {}", alert.log, alert.reason);
        if self.keywords.critical.iter().any(|r| r.is_match(&haystack)) {
            1.0
        } else if self.keywords.high.iter().any(|r| r.is_match(&haystack)) {
            0.7
        } else if self.keywords.medium.iter().any(|r| r.is_match(&haystack)) {
            0.4
        } else {
            0.1
        }
    }

    fn service_score(&self, alert: &Alert) -> f64 {
        let haystack = alert.log.to_lowercase();
        let matched = self
            .services
            .iter()
            .find(|s| haystack.contains(&s.name.to_lowercase()))
            .or_else(|| {
                alert
                    .metadata
                    .service
                    .as_ref()
                    .and_then(|name| self.services.iter().find(|s| &s.name == name))
            });
        match matched {
            Some(service) => {
                let criticality_term = service.criticality.weight() * 0.6;
                let user_term = (service.user_count as f64 / 100_000.0).min(1.0) * 0.4;
                criticality_term + user_term
            }
            None => 0.3,
        }
    }

    fn time_score(&self, now: chrono::DateTime<chrono::Utc>) -> f64 {
        use chrono::{Datelike, Timelike, Weekday};
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return 0.3;
        }
        let hour = now.hour();
        let in_business_hours =
            hour >= self.business_hours.start_hour && hour < self.business_hours.end_hour;
        if !in_business_hours {
            return 0.5;
        }
        let in_peak = match (
            self.business_hours.peak_start_hour,
            self.business_hours.peak_end_hour,
        ) {
            (Some(start), Some(end)) => hour >= start && hour < end,
            _ => false,
        };
        if in_peak {
            1.0f64.min(1.1)
        } else {
            1.0
        }
    }
}
