//! Event sources for the pacing loop.
//!
//! The loop only needs [`EventGenerator`]; any `Iterator<Item = Event>` is one.
//! [`SyntheticGenerator`] produces a deterministic Nexmark-style stream of
//! people, auctions and bids serialized as JSON.

use crate::event::Event;
use serde::Serialize;

/// Ordered, finite, non-restartable source of events.
pub trait EventGenerator: Send {
    /// Next event, or `None` once exhausted.
    fn next_event(&mut self) -> Option<Event>;
}

impl<I> EventGenerator for I
where
    I: Iterator<Item = Event> + Send,
{
    fn next_event(&mut self) -> Option<Event> {
        self.next()
    }
}

// Nexmark default proportions per 50 events.
const PERSON_PROPORTION: u64 = 1;
const AUCTION_PROPORTION: u64 = 3;
const BID_PROPORTION: u64 = 46;
const TOTAL_PROPORTION: u64 = PERSON_PROPORTION + AUCTION_PROPORTION + BID_PROPORTION;

const FIRST_PERSON_ID: u64 = 1000;
const FIRST_AUCTION_ID: u64 = 1000;

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Total number of events to produce.
    pub max_events: u64,
    /// Target arrival rate; determines the spacing of wall-clock timestamps.
    pub events_per_second: u32,
    /// Timestamp of the first event, ms since epoch.
    pub base_time_ms: i64,
    pub first_event_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
enum NexmarkEvent {
    Person {
        id: u64,
        name: String,
        email_address: String,
        city: &'static str,
        state: &'static str,
        date_time: i64,
    },
    Auction {
        id: u64,
        item_name: String,
        initial_bid: u64,
        reserve: u64,
        expires: i64,
        seller: u64,
        category: u64,
        date_time: i64,
    },
    Bid {
        auction: u64,
        bidder: u64,
        price: u64,
        channel: &'static str,
        date_time: i64,
    },
}

const CITIES: [(&str, &str); 5] = [
    ("Phoenix", "AZ"),
    ("Los Angeles", "CA"),
    ("San Francisco", "CA"),
    ("Boise", "ID"),
    ("Portland", "OR"),
];
const CHANNELS: [&str; 4] = ["Google", "Facebook", "Baidu", "Apple"];

pub struct SyntheticGenerator {
    config: GeneratorConfig,
    emitted: u64,
    inter_event_delay_us: u64,
}

impl SyntheticGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let rate = u64::from(config.events_per_second.max(1));
        Self {
            inter_event_delay_us: 1_000_000 / rate,
            config,
            emitted: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.config.max_events.saturating_sub(self.emitted)
    }

    fn timestamp_for(&self, index: u64) -> i64 {
        let offset_ms = (index * self.inter_event_delay_us / 1_000) as i64;
        self.config.base_time_ms.saturating_add(offset_ms)
    }

    fn build(&self, event_id: u64, ts: i64) -> NexmarkEvent {
        let epoch = event_id / TOTAL_PROPORTION;
        let offset = event_id % TOTAL_PROPORTION;
        // Ids only move forward, so bids always reference people and auctions
        // that already exist.
        let last_person = FIRST_PERSON_ID + epoch * PERSON_PROPORTION;
        let last_auction = FIRST_AUCTION_ID + epoch * AUCTION_PROPORTION;
        if offset < PERSON_PROPORTION {
            let (city, state) = CITIES[(event_id % CITIES.len() as u64) as usize];
            NexmarkEvent::Person {
                id: last_person,
                name: format!("person-{last_person}"),
                email_address: format!("person-{last_person}@example.com"),
                city,
                state,
                date_time: ts,
            }
        } else if offset < PERSON_PROPORTION + AUCTION_PROPORTION {
            let id = last_auction + (offset - PERSON_PROPORTION);
            let initial_bid = 100 + (event_id * 7) % 900;
            NexmarkEvent::Auction {
                id,
                item_name: format!("item-{id}"),
                initial_bid,
                reserve: initial_bid * 2,
                expires: ts + 10_000,
                seller: last_person,
                category: 10 + event_id % 5,
                date_time: ts,
            }
        } else {
            NexmarkEvent::Bid {
                auction: last_auction + event_id % AUCTION_PROPORTION,
                bidder: FIRST_PERSON_ID + (event_id * 31) % (epoch + 1),
                price: 100 + (event_id * 13) % 10_000,
                channel: CHANNELS[(event_id % CHANNELS.len() as u64) as usize],
                date_time: ts,
            }
        }
    }
}

impl Iterator for SyntheticGenerator {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.emitted >= self.config.max_events {
            return None;
        }
        let index = self.emitted;
        let ts = self.timestamp_for(index);
        let body = self.build(self.config.first_event_id + index, ts);
        self.emitted += 1;
        match serde_json::to_string(&body) {
            Ok(payload) => Some(Event::new(ts, payload)),
            Err(e) => {
                tracing::error!(error = %e, index, "failed to serialize synthetic event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_events: u64, rate: u32) -> GeneratorConfig {
        GeneratorConfig {
            max_events,
            events_per_second: rate,
            base_time_ms: 1_700_000_000_000,
            first_event_id: 0,
        }
    }

    #[test]
    fn produces_bounded_non_decreasing_stream() {
        let events: Vec<Event> = SyntheticGenerator::new(config(120, 10)).collect();
        assert_eq!(events.len(), 120);
        assert!(
            events
                .windows(2)
                .all(|w| w[0].wallclock_timestamp <= w[1].wallclock_timestamp)
        );
        assert_eq!(events[10].wallclock_timestamp, 1_700_000_000_000 + 1_000);
    }

    #[test]
    fn mixes_event_kinds_in_nexmark_proportions() {
        let kinds: Vec<String> = SyntheticGenerator::new(config(50, 1000))
            .map(|e| {
                let v: serde_json::Value = serde_json::from_str(&e.payload).unwrap();
                v["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds.iter().filter(|k| *k == "person").count(), 1);
        assert_eq!(kinds.iter().filter(|k| *k == "auction").count(), 3);
        assert_eq!(kinds.iter().filter(|k| *k == "bid").count(), 46);
    }

    #[test]
    fn vec_iterator_is_a_generator() {
        let mut g = vec![Event::new(1, "a")].into_iter();
        assert_eq!(g.next_event(), Some(Event::new(1, "a")));
        assert_eq!(g.next_event(), None);
    }
}
