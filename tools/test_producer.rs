//! Test Income Producer
//!
//! Generates seeded income histories for a population of people and publishes
//! their profiles and transactions to NATS for pipeline testing.
//!
//! Usage: test_producer [nats_url] [people] [anomaly_rate] [months] [seed] [delay_ms]

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, TimeZone, Utc};
use income_anomaly_pipeline::types::{Channel, IncomeTier, PersonProfile, Sector, Transaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{info, warn};

const PROFILE_SUBJECT: &str = "income.profiles";
const TRANSACTION_SUBJECT: &str = "income.transactions";

const SECTORS: [Sector; 13] = [
    Sector::Agriculture,
    Sector::Construction,
    Sector::DomesticWork,
    Sector::Education,
    Sector::GigEconomy,
    Sector::Healthcare,
    Sector::Manufacturing,
    Sector::OfficeWork,
    Sector::Retail,
    Sector::SelfEmployed,
    Sector::SkilledTrade,
    Sector::StreetVendor,
    Sector::Transport,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Archetype {
    Salaried,
    Gig,
    Structuring,
    Spike,
    DormantBurst,
}

impl Archetype {
    fn is_anomalous(self) -> bool {
        matches!(self, Self::Structuring | Self::Spike | Self::DormantBurst)
    }
}

/// One person's generated history
struct Person {
    profile: PersonProfile,
    archetype: Archetype,
    transactions: Vec<Transaction>,
}

/// Seeded income history generator
struct IncomeGenerator {
    rng: StdRng,
    transaction_counter: u64,
    months: u32,
    /// Exclusive end of the generated history (a month start in UTC)
    history_end: DateTime<Utc>,
}

impl IncomeGenerator {
    fn new(seed: u64, months: u32) -> Self {
        let now = Utc::now();
        let history_end = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        Self {
            rng: StdRng::seed_from_u64(seed),
            transaction_counter: 0,
            months,
            history_end,
        }
    }

    fn month_start(&self, months_ago: u32) -> DateTime<Utc> {
        self.history_end
            .checked_sub_months(Months::new(months_ago))
            .unwrap_or(self.history_end)
    }

    fn next_id(&mut self) -> String {
        self.transaction_counter += 1;
        format!("tx_{:012}", self.transaction_counter)
    }

    /// Credit time on a given day of the month, inside or outside the night band
    fn at(&mut self, month: DateTime<Utc>, day: i64, night: bool) -> DateTime<Utc> {
        let hour = if night {
            self.rng.gen_range(0..4)
        } else {
            self.rng.gen_range(4..12)
        };
        month + ChronoDuration::days(day) + ChronoDuration::hours(hour) + ChronoDuration::minutes(self.rng.gen_range(0..60))
    }

    fn generate(&mut self, index: usize, anomaly_rate: f64) -> Person {
        let person_id = format!("person_{:05}", index);
        let archetype = if self.rng.gen_bool(anomaly_rate) {
            [Archetype::Structuring, Archetype::Spike, Archetype::DormantBurst][self.rng.gen_range(0..3)]
        } else if self.rng.gen_bool(0.5) {
            Archetype::Salaried
        } else {
            Archetype::Gig
        };

        let (sector, tier, formal) = match archetype {
            Archetype::Salaried => (Sector::OfficeWork, IncomeTier::Medium, true),
            Archetype::Gig => (Sector::GigEconomy, IncomeTier::Low, false),
            _ => (SECTORS[self.rng.gen_range(0..SECTORS.len())], IncomeTier::Low, false),
        };

        let transactions = match archetype {
            Archetype::Salaried => self.salaried(&person_id),
            Archetype::Gig => self.gig(&person_id),
            Archetype::Structuring => self.structuring(&person_id),
            Archetype::Spike => self.spike(&person_id),
            Archetype::DormantBurst => self.dormant_burst(&person_id),
        };

        Person {
            profile: PersonProfile::new(person_id, sector, tier, formal),
            archetype,
            transactions,
        }
    }

    fn salaried(&mut self, person_id: &str) -> Vec<Transaction> {
        let salary = self.rng.gen_range(25_000.0..80_000.0_f64).round();
        let employer = format!("EMP_{}", self.rng.gen_range(1..500));
        (1..=self.months)
            .rev()
            .map(|ago| {
                let month = self.month_start(ago);
                let ts = self.at(month, 0, false);
                Transaction::new(self.next_id(), person_id, employer.clone(), salary, ts)
            })
            .collect()
    }

    fn gig(&mut self, person_id: &str) -> Vec<Transaction> {
        let platforms = ["PLATFORM_RIDE", "PLATFORM_FOOD", "PLATFORM_TASK"];
        let mut out = Vec::new();
        for ago in (1..=self.months).rev() {
            let month = self.month_start(ago);
            for _ in 0..self.rng.gen_range(3..7) {
                let day = self.rng.gen_range(0..27);
                let ts = self.at(month, day, false);
                let amount = (self.rng.gen_range(1_500.0..6_000.0_f64) * 100.0).round() / 100.0;
                let platform = platforms[self.rng.gen_range(0..platforms.len())];
                out.push(Transaction::new(self.next_id(), person_id, platform, amount, ts).via(Channel::Digital));
            }
        }
        out
    }

    /// Steady cash income, then repeated deposits just under 50k from unverified payers
    fn structuring(&mut self, person_id: &str) -> Vec<Transaction> {
        let mut out = Vec::new();
        for ago in (1..=self.months).rev() {
            let month = self.month_start(ago);
            if ago > 2 {
                let ts = self.at(month, 4, false);
                let amount = self.rng.gen_range(8_000.0..15_000.0_f64).round();
                out.push(Transaction::new(self.next_id(), person_id, "SHOP_LOCAL", amount, ts).via(Channel::Cash));
            } else {
                for n in 0..4 {
                    let ts = self.at(month, 2 + n * 6, true);
                    let amount = self.rng.gen_range(49_000.0..49_900.0_f64).round();
                    let payer = format!("UNKNOWN_{}", self.rng.gen_range(1..10_000));
                    out.push(
                        Transaction::new(self.next_id(), person_id, payer, amount, ts)
                            .unverified()
                            .via(Channel::Cash),
                    );
                }
            }
        }
        out
    }

    /// Modest monthly wages with one enormous final month
    fn spike(&mut self, person_id: &str) -> Vec<Transaction> {
        let wage = self.rng.gen_range(8_000.0..12_000.0_f64).round();
        (1..=self.months)
            .rev()
            .map(|ago| {
                let month = self.month_start(ago);
                let ts = self.at(month, 9, false);
                let amount = if ago == 1 { wage * 30.0 } else { wage };
                Transaction::new(self.next_id(), person_id, "EMP_SMALL", amount, ts)
            })
            .collect()
    }

    /// A quiet history followed by a dense burst of unverified credits
    fn dormant_burst(&mut self, person_id: &str) -> Vec<Transaction> {
        let mut out = Vec::new();
        for ago in (1..=self.months).rev() {
            let month = self.month_start(ago);
            if ago == 1 {
                for _ in 0..12 {
                    let day = self.rng.gen_range(0..27);
                    let night = self.rng.gen_bool(0.5);
                    let ts = self.at(month, day, night);
                    let amount = self.rng.gen_range(5_000.0..20_000.0_f64).round();
                    let payer = format!("PAYER_{}", self.rng.gen_range(1..50));
                    out.push(Transaction::new(self.next_id(), person_id, payer, amount, ts).unverified());
                }
            } else if ago % 3 == 0 {
                let ts = self.at(month, 14, false);
                out.push(Transaction::new(self.next_id(), person_id, "FAMILY", 2_000.0, ts).via(Channel::Cash));
            }
        }
        out
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Income Producer");

    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let people: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(100);
    let anomaly_rate: f64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0.1);
    let months: u32 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(12);
    let seed: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(42);
    let delay_ms: u64 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or(0);

    info!(
        nats_url = %nats_url,
        people,
        anomaly_rate,
        months,
        seed,
        delay_ms,
        "Configuration loaded"
    );

    let mut generator = IncomeGenerator::new(seed, months.max(2));
    let population: Vec<Person> = (0..people)
        .map(|i| generator.generate(i, anomaly_rate.clamp(0.0, 1.0)))
        .collect();
    let anomalous = population.iter().filter(|p| p.archetype.is_anomalous()).count();
    info!(
        people = population.len(),
        anomalous,
        transactions = generator.transaction_counter,
        "Population generated"
    );

    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(&population);
        }
    };

    // Profiles first so the pipeline can encode every person it sees
    for person in &population {
        let payload = serde_json::to_vec(&person.profile)?;
        client.publish(PROFILE_SUBJECT.to_string(), payload.into()).await?;
    }
    info!("Published {} profiles to {}", population.len(), PROFILE_SUBJECT);

    let mut published = 0u64;
    for person in &population {
        for tx in &person.transactions {
            let payload = serde_json::to_vec(tx)?;
            client.publish(TRANSACTION_SUBJECT.to_string(), payload.into()).await?;
            published += 1;

            if published % 500 == 0 {
                info!("Published {}/{} transactions", published, generator.transaction_counter);
            }
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
    client.flush().await?;

    info!(
        "Completed! Published {} transactions for {} people ({} anomalous)",
        published,
        population.len(),
        anomalous
    );

    Ok(())
}

fn run_dry_mode(population: &[Person]) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    for person in population.iter().take(5) {
        info!(
            person_id = %person.profile.person_id,
            archetype = ?person.archetype,
            transactions = person.transactions.len(),
            "Sample person"
        );
        if let Some(tx) = person.transactions.last() {
            info!("Latest transaction:\n{}", serde_json::to_string_pretty(tx)?);
        }
    }

    Ok(())
}
