//! Synchronous answers to tool calls made during a live phone conversation.
//!
//! Each answer is a pure function of the function name and its arguments
//! (plus the current date for availability), cached per normalized
//! argument set so repeated questions are served from memory.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::cache_service::{JsonCache, Lookup};
use super::pricing::{format_price, normalize_postal_code, PricingCatalog};
use crate::domain::models::{PricingConfig, ToolCallRequest, ToolCallResult, ToolsConfig};

const MORNING_WINDOW: &str = "08:00-12:00";
const AFTERNOON_WINDOW: &str = "13:00-17:00";

/// Functions the voice assistant may call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFunction {
    Quote,
    Availability,
    ServiceArea,
    Unknown(String),
}

impl ToolFunction {
    pub fn from_name(name: &str) -> Self {
        match name {
            "getQuote" | "get_quote" | "priceQuote" => Self::Quote,
            "checkAvailability" | "getAvailability" => Self::Availability,
            "checkServiceArea" | "serviceArea" => Self::ServiceArea,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Canonical name, used in cache keys so aliases share entries.
    pub fn canonical(&self) -> &str {
        match self {
            Self::Quote => "getQuote",
            Self::Availability => "checkAvailability",
            Self::ServiceArea => "checkServiceArea",
            Self::Unknown(name) => name,
        }
    }
}

/// Computes tool-call results, consulting the shared cache first.
pub struct ToolResponseBuilder {
    cache: Arc<JsonCache>,
    catalog: PricingCatalog,
    ttl: Duration,
    availability_days: u32,
    fixed_date: Option<NaiveDate>,
}

impl ToolResponseBuilder {
    pub fn new(cache: Arc<JsonCache>, pricing: PricingConfig, tools: &ToolsConfig) -> Self {
        Self {
            cache,
            catalog: PricingCatalog::new(pricing),
            ttl: tools.result_ttl(),
            availability_days: tools.availability_days.max(1),
            fixed_date: None,
        }
    }

    /// Pin "today" for availability answers.
    #[must_use]
    pub fn with_fixed_date(mut self, date: NaiveDate) -> Self {
        self.fixed_date = Some(date);
        self
    }

    pub const fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    /// One result per request, in request order, each echoing its request id.
    pub async fn build(&self, requests: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let answer = self.answer(request).await;
            results.push(ToolCallResult {
                tool_call_id: request.id.clone(),
                result: answer.value,
            });
        }
        results
    }

    /// Answer a single tool call, reporting whether it came from the cache.
    pub async fn answer(&self, request: &ToolCallRequest) -> Lookup<Value> {
        let function = ToolFunction::from_name(&request.function_name);

        if let ToolFunction::Unknown(name) = &function {
            info!(function = %name, tool_call_id = %request.id, "unsupported tool function, answering with fallback");
            return Lookup {
                value: fallback_result(name),
                cache_hit: false,
            };
        }

        let today = self.today();
        let key = self.cache_key(&function, &request.arguments, today);
        let lookup = self
            .cache
            .get_or_set(&key, Some(self.ttl), || async {
                Ok::<_, Infallible>(self.compute(&function, &request.arguments, today))
            })
            .await;

        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(never) => match never {},
        };
        debug!(function = function.canonical(), cache_hit = lookup.cache_hit, "tool call answered");
        lookup
    }

    fn today(&self) -> NaiveDate {
        self.fixed_date.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn cache_key(&self, function: &ToolFunction, arguments: &Map<String, Value>, today: NaiveDate) -> String {
        let normalized = normalize_arguments(arguments);
        let args = serde_json::to_string(&normalized).unwrap_or_default();
        match function {
            ToolFunction::Availability => format!("tool:{}:{today}:{args}", function.canonical()),
            _ => format!("tool:{}:{args}", function.canonical()),
        }
    }

    fn compute(&self, function: &ToolFunction, arguments: &Map<String, Value>, today: NaiveDate) -> Value {
        match function {
            ToolFunction::Quote => self.quote(arguments),
            ToolFunction::Availability => self.availability(today),
            ToolFunction::ServiceArea => self.service_area(arguments),
            ToolFunction::Unknown(name) => fallback_result(name),
        }
    }

    fn quote(&self, arguments: &Map<String, Value>) -> Value {
        let service = string_arg(arguments, &["serviceType", "service_type", "service"]);
        let location = string_arg(arguments, &["location", "city", "postalCode", "postal_code", "address"]);

        let Some(service) = service else {
            return json!({
                "service": Value::Null,
                "availableServices": self.catalog.services(),
                "message": "Quel type de service désirez-vous? Nous offrons le débouchage, l'inspection par caméra, le nettoyage, l'installation et le service d'urgence.",
            });
        };

        match self.catalog.quote(service, location) {
            Some(quote) => {
                let price = quote.price_text();
                let message = match quote.surcharge {
                    Some(surcharge) => format!(
                        "Le tarif pour le service {} est de {price}, incluant des frais de déplacement de {} pour votre secteur. Taxes en sus.",
                        quote.service,
                        format_price(surcharge)
                    ),
                    None => format!(
                        "Le tarif pour le service {} est de {price}. Taxes en sus.",
                        quote.service
                    ),
                };
                json!({
                    "service": quote.service,
                    "price": price,
                    "message": message,
                })
            }
            None => json!({
                "service": service,
                "availableServices": self.catalog.services(),
                "message": format!(
                    "Le service {service} ne fait pas partie de nos services. Un conseiller pourra vous rappeler pour une soumission."
                ),
            }),
        }
    }

    fn availability(&self, today: NaiveDate) -> Value {
        let days = next_business_days(today, self.availability_days);
        let slots: Vec<Value> = days
            .iter()
            .flat_map(|day| {
                [MORNING_WINDOW, AFTERNOON_WINDOW]
                    .into_iter()
                    .map(move |window| json!({ "date": day.to_string(), "window": window }))
            })
            .collect();

        let first = days
            .first()
            .map(|day| format!("{day} entre {MORNING_WINDOW}"))
            .unwrap_or_default();

        json!({
            "available": !slots.is_empty(),
            "slots": slots,
            "message": format!("Notre prochaine disponibilité est le {first}. D'autres plages sont offertes les jours suivants."),
        })
    }

    fn service_area(&self, arguments: &Map<String, Value>) -> Value {
        let Some(raw) = string_arg(arguments, &["postalCode", "postal_code", "codePostal", "zip"]) else {
            return json!({
                "served": false,
                "region": Value::Null,
                "surcharge": false,
                "message": "Pouvez-vous me donner votre code postal?",
            });
        };

        let postal_code = normalize_postal_code(raw);
        match self.catalog.area_for(&postal_code) {
            Some(area) => {
                let message = if area.surcharge {
                    format!(
                        "Nous desservons {}. Des frais de déplacement de {} s'appliquent.",
                        area.region,
                        format_price(self.catalog.surcharge())
                    )
                } else {
                    format!("Nous desservons {} sans frais de déplacement.", area.region)
                };
                json!({
                    "postalCode": postal_code,
                    "served": true,
                    "region": area.region,
                    "surcharge": area.surcharge,
                    "message": message,
                })
            }
            None => json!({
                "postalCode": postal_code,
                "served": false,
                "region": Value::Null,
                "surcharge": false,
                "message": "Ce secteur n'est pas desservi par nos équipes.",
            }),
        }
    }
}

/// Sorted keys, trimmed lower-case strings; other values kept as-is.
fn normalize_arguments(arguments: &Map<String, Value>) -> BTreeMap<String, Value> {
    arguments
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => Value::String(s.trim().to_lowercase()),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// First non-blank string among the given argument names.
fn string_arg<'a>(arguments: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| arguments.get(*name).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn next_business_days(after: NaiveDate, count: u32) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = after;
    while days.len() < count as usize {
        day += ChronoDuration::days(1);
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
    }
    days
}

fn fallback_result(function_name: &str) -> Value {
    json!({
        "handled": false,
        "function": function_name,
        "message": "Je n'ai pas cette information pour le moment. Un conseiller vous rappellera sous peu.",
    })
}
