//! Placeholder providers served when an API source is down.
//!
//! Every record is marked `synthetic`; the pipeline never persists them.

use prisguide_core::{Category, SourceRecord};

struct SeedProvider {
    name: &'static str,
    price: f64,
    rating: f64,
    description: &'static str,
    url: &'static str,
}

const ELECTRICITY: &[SeedProvider] = &[
    SeedProvider { name: "Tibber", price: 39.0, rating: 4.6, description: "Spotpris med smart styring i appen", url: "https://tibber.com/no" },
    SeedProvider { name: "Fjordkraft", price: 49.0, rating: 4.1, description: "Strømavtaler for hele landet", url: "https://www.fjordkraft.no" },
    SeedProvider { name: "Fortum", price: 45.0, rating: 3.9, description: "Spotpris og fastpris", url: "https://www.fortum.no" },
];

const MOBILE: &[SeedProvider] = &[
    SeedProvider { name: "Telia", price: 299.0, rating: 4.0, description: "Mobilabonnement med 5G", url: "https://www.telia.no" },
    SeedProvider { name: "Telenor", price: 349.0, rating: 4.2, description: "Norges største mobilnett", url: "https://www.telenor.no" },
    SeedProvider { name: "Ice", price: 249.0, rating: 3.8, description: "Rimelige abonnement uten binding", url: "https://www.ice.no" },
];

const INTERNET: &[SeedProvider] = &[
    SeedProvider { name: "Telenor", price: 599.0, rating: 4.0, description: "Fiber og mobilt bredbånd", url: "https://www.telenor.no/bredband" },
    SeedProvider { name: "Altibox", price: 649.0, rating: 4.3, description: "Fiberbredbånd med TV", url: "https://www.altibox.no" },
    SeedProvider { name: "Telia", price: 549.0, rating: 3.9, description: "Bredbånd via fiber og 4G", url: "https://www.telia.no/bredband" },
];

const INSURANCE: &[SeedProvider] = &[
    SeedProvider { name: "Gjensidige", price: 389.0, rating: 4.2, description: "Innbo, bil og reise", url: "https://www.gjensidige.no" },
    SeedProvider { name: "If", price: 359.0, rating: 4.1, description: "Forsikring for privatpersoner", url: "https://www.if.no" },
    SeedProvider { name: "Tryg", price: 375.0, rating: 3.9, description: "Skadeforsikring", url: "https://www.tryg.no" },
];

const BANKING: &[SeedProvider] = &[
    SeedProvider { name: "DNB", price: 0.0, rating: 3.9, description: "Norges største bank", url: "https://www.dnb.no" },
    SeedProvider { name: "Nordea", price: 0.0, rating: 3.7, description: "Nordisk bank med brukskonto og lån", url: "https://www.nordea.no" },
    SeedProvider { name: "SpareBank 1", price: 0.0, rating: 4.1, description: "Lokale sparebanker i alliansen", url: "https://www.sparebank1.no" },
];

const HOME_ALARM: &[SeedProvider] = &[
    SeedProvider { name: "Verisure", price: 449.0, rating: 4.0, description: "Boligalarm med vekterutrykning", url: "https://www.verisure.no" },
    SeedProvider { name: "Sector Alarm", price: 399.0, rating: 3.9, description: "Alarm med døgnbemannet alarmsentral", url: "https://www.sectoralarm.no" },
    SeedProvider { name: "Securitas", price: 429.0, rating: 3.8, description: "Smarthjemalarm", url: "https://www.securitas.no" },
];

fn providers_for(category: Category) -> &'static [SeedProvider] {
    match category {
        Category::Electricity => ELECTRICITY,
        Category::Mobile => MOBILE,
        Category::Internet => INTERNET,
        Category::Insurance => INSURANCE,
        Category::Banking => BANKING,
        Category::HomeAlarm => HOME_ALARM,
    }
}

pub fn fallback_providers(category: Category) -> Vec<SourceRecord> {
    providers_for(category)
        .iter()
        .map(|p| SourceRecord {
            name: p.name.to_string(),
            price: p.price,
            rating: p.rating,
            description: p.description.to_string(),
            external_url: p.url.to_string(),
            synthetic: true,
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_has_synthetic_seed() {
        for category in Category::ALL {
            let seed = fallback_providers(category);
            assert!(!seed.is_empty(), "{category} has no seed");
            assert!(seed.iter().all(|r| r.synthetic && (0.0..=5.0).contains(&r.rating)));
        }
    }
}
