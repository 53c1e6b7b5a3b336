//! Price table and service-area geography.

use crate::domain::models::{PricingConfig, ServiceArea};

/// A priced intervention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub service: String,
    pub base_rate: u32,
    pub surcharge: Option<u32>,
}

impl Quote {
    pub fn total(&self) -> u32 {
        self.base_rate + self.surcharge.unwrap_or(0)
    }

    /// The one textual rendering of the price. Cached answers carry exactly this string.
    pub fn price_text(&self) -> String {
        format_price(self.total())
    }
}

pub fn format_price(amount: u32) -> String {
    format!("{amount}$")
}

/// Lookup tables built from [`PricingConfig`].
#[derive(Debug, Clone)]
pub struct PricingCatalog {
    config: PricingConfig,
    far_zones: Vec<String>,
}

impl PricingCatalog {
    pub fn new(config: PricingConfig) -> Self {
        let far_zones = config.far_zones.iter().map(|zone| fold(zone)).collect();
        Self { config, far_zones }
    }

    /// Known service types, sorted.
    pub fn services(&self) -> Vec<&str> {
        self.config.base_rates.keys().map(String::as_str).collect()
    }

    pub const fn surcharge(&self) -> u32 {
        self.config.surcharge
    }

    /// Price a service at a location. `None` when the service is not offered.
    pub fn quote(&self, service_type: &str, location: Option<&str>) -> Option<Quote> {
        let service = fold(service_type);
        let base_rate = *self.config.base_rates.get(&service)?;
        let surcharge = location
            .filter(|location| self.is_surcharge_zone(location))
            .map(|_| self.config.surcharge);

        Some(Quote {
            service,
            base_rate,
            surcharge,
        })
    }

    /// Whether a location (locality name or postal code) is in a far zone.
    ///
    /// A far zone must match a whole comma-separated part of the location, so
    /// `"Joliette, QC"` is surcharged but `"rue Joliette, Montréal"` is not.
    pub fn is_surcharge_zone(&self, location: &str) -> bool {
        let in_far_zone = location
            .split(|c: char| matches!(c, ',' | ';' | '(' | ')' | '/'))
            .map(fold)
            .any(|part| self.far_zones.contains(&part));
        if in_far_zone {
            return true;
        }
        self.area_for(location).is_some_and(|area| area.surcharge)
    }

    /// Longest configured prefix matching the postal code.
    pub fn area_for(&self, postal_code: &str) -> Option<&ServiceArea> {
        let code = normalize_postal_code(postal_code);
        if code.is_empty() {
            return None;
        }

        self.config
            .service_areas
            .iter()
            .filter(|area| code.starts_with(&normalize_postal_code(&area.prefix)))
            .max_by_key(|area| normalize_postal_code(&area.prefix).len())
    }
}

/// Upper-case and strip whitespace: `"j7z 1a1"` becomes `"J7Z1A1"`.
pub fn normalize_postal_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Lower-case, trim, fold French accents and turn spaces into hyphens,
/// so `" Débouchage "` matches `"debouchage"` and `"Saint Jérôme"` matches `"saint-jerome"`.
pub fn fold(raw: &str) -> String {
    raw.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            ' ' => '-',
            other => other,
        })
        .collect()
}
