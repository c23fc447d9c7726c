//! Fanout / merge engine.
//!
//! One logical lookup dispatches to every participating site concurrently,
//! then the per-site results merge field-by-field under the configured
//! priority policy. Lookups for the same catalog number share one crawl:
//! later callers wait for the first and reuse its outcome, success or
//! failure.

pub mod merge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, Semaphore};

use crate::client::AvWebClient;
use crate::config::{Config, Website};
use crate::crawlers::browser::BrowserFetcher;
use crate::crawlers::{build_crawlers, SiteCrawler};
use crate::events::{EventBus, PipelineEvent, SiteOutcomeEvent};
use crate::gather::GatherGroup;
use crate::types::{CrawlerData, CrawlerInput, MergedRecord};

enum NumberState {
    InFlight(Arc<Notify>),
    Done(Option<MergedRecord>),
}

/// Scraping engine: one instance per deployment.
pub struct ScrapeEngine {
    config: Config,
    client: Arc<AvWebClient>,
    crawlers: HashMap<Website, Arc<dyn SiteCrawler>>,
    events: Arc<EventBus>,
    lookup_slots: Arc<Semaphore>,
    shared_numbers: Mutex<HashMap<String, NumberState>>,
}

impl ScrapeEngine {
    pub fn new(config: Config) -> Result<Self, crate::client::WebError> {
        let events = Arc::new(EventBus::new());
        let client = Arc::new(AvWebClient::with_events(&config, events.clone())?);
        let crawlers = build_crawlers(client.clone(), None, &config);
        Ok(Self::from_parts(config, client, crawlers, events))
    }

    /// Engine with a shared headless browser for JS-rendered sites.
    pub fn with_browser(
        config: Config,
        browser: Arc<BrowserFetcher>,
    ) -> Result<Self, crate::client::WebError> {
        let events = Arc::new(EventBus::new());
        let client = Arc::new(AvWebClient::with_events(&config, events.clone())?);
        let crawlers = build_crawlers(client.clone(), Some(browser), &config);
        Ok(Self::from_parts(config, client, crawlers, events))
    }

    /// Assemble from preconstructed parts (tests, custom crawler sets).
    pub fn from_parts(
        config: Config,
        client: Arc<AvWebClient>,
        crawlers: HashMap<Website, Arc<dyn SiteCrawler>>,
        events: Arc<EventBus>,
    ) -> Self {
        let lookup_slots = Arc::new(Semaphore::new(config.lookup_concurrency));
        Self {
            config,
            client,
            crawlers,
            events,
            lookup_slots,
            shared_numbers: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Forget shared-number outcomes (start of a new scrape batch).
    pub async fn reset_shared_numbers(&self) {
        self.shared_numbers.lock().await.clear();
    }

    /// Run one lookup across all participating sites and merge the results.
    /// Returns `None` when every site fails.
    pub async fn call_crawlers(&self, input: &CrawlerInput) -> Option<MergedRecord> {
        let number_key = input.number.trim().to_uppercase();

        // Same-number dedup: piggyback on an in-flight crawl when one
        // exists, and reuse finished outcomes without re-crawling.
        let notify = {
            let mut shared = self.shared_numbers.lock().await;
            match shared.get(&number_key) {
                Some(NumberState::Done(result)) => return result.clone(),
                Some(NumberState::InFlight(notify)) => Some(notify.clone()),
                None => {
                    shared.insert(
                        number_key.clone(),
                        NumberState::InFlight(Arc::new(Notify::new())),
                    );
                    None
                }
            }
        };
        if let Some(notify) = notify {
            let grace = self.config.lookup_timeout();
            let _ = tokio::time::timeout(grace, notify.notified()).await;
            let shared = self.shared_numbers.lock().await;
            return match shared.get(&number_key) {
                Some(NumberState::Done(result)) => result.clone(),
                _ => None,
            };
        }

        let _slot = self.lookup_slots.clone().acquire_owned().await.ok();
        let result = self.crawl_all_sites(input).await;

        {
            let mut shared = self.shared_numbers.lock().await;
            if let Some(NumberState::InFlight(notify)) = shared.insert(
                number_key,
                NumberState::Done(result.clone()),
            ) {
                notify.notify_waiters();
            }
        }
        result
    }

    async fn crawl_all_sites(&self, input: &CrawlerInput) -> Option<MergedRecord> {
        let sites = self.config.field_priorities.participating_sites();
        let mut group: GatherGroup<(Website, Result<CrawlerData, String>, f64)> =
            GatherGroup::with_timeout(self.config.lookup_timeout());

        for site in sites {
            let Some(crawler) = self.crawlers.get(&site) else {
                continue;
            };
            let crawler = crawler.clone();
            // Every task works on its own copy; the shared input is
            // untouched however the site task ends.
            let task_input = input.clone();
            group.add(async move {
                let started = Instant::now();
                let result = crawler
                    .crawl(&task_input)
                    .await
                    .map_err(|err| err.to_string());
                (site, result, started.elapsed().as_secs_f64())
            });
        }
        if group.is_empty() {
            return None;
        }

        let mut results: HashMap<Website, CrawlerData> = HashMap::new();
        for outcome in group.join().await {
            let (site, result, elapsed) = match outcome {
                Ok(tuple) => tuple,
                Err(err) => {
                    self.events.publish(PipelineEvent::Note(format!(
                        "🔴 site task aborted: {err}"
                    )));
                    continue;
                }
            };
            let elapsed = std::time::Duration::from_secs_f64(elapsed);
            match result {
                Ok(data) => {
                    self.events
                        .publish(PipelineEvent::SiteOutcome(SiteOutcomeEvent {
                            site,
                            number: input.number.clone(),
                            success: true,
                            detail: String::new(),
                            elapsed,
                            timestamp: Utc::now(),
                        }));
                    results.insert(site, data);
                }
                Err(detail) => {
                    self.events
                        .publish(PipelineEvent::SiteOutcome(SiteOutcomeEvent {
                            site,
                            number: input.number.clone(),
                            success: false,
                            detail,
                            elapsed,
                            timestamp: Utc::now(),
                        }));
                }
            }
        }
        if results.is_empty() {
            return None;
        }

        let mut record = merge::merge_by_priority(&results, &self.config.field_priorities);
        if record.data.number.is_empty() {
            record.data.number = input.number.clone();
        }
        record.data.normalize();
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldPriorities;
    use crate::crawlers::{Context, CrawlerError};
    use crate::types::Field;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FakeCrawler {
        site: Website,
        client: Arc<AvWebClient>,
        data: Option<CrawlerData>,
        delay: Duration,
        calls: Arc<AtomicU32>,
        seen_numbers: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SiteCrawler for FakeCrawler {
        fn site(&self) -> Website {
            self.site
        }

        fn base_url(&self) -> String {
            String::new()
        }

        fn client(&self) -> &Arc<AvWebClient> {
            &self.client
        }

        fn adapt_input(&self, input: &CrawlerInput) -> CrawlerInput {
            let mut adapted = input.clone();
            if self.site == Website::Dmm && !input.short_number.is_empty() {
                adapted.number = input.short_number.clone();
            }
            adapted
        }

        async fn generate_search_urls(
            &self,
            _ctx: &mut Context,
        ) -> Result<Vec<String>, CrawlerError> {
            unreachable!("crawl() is overridden")
        }

        async fn parse_search_page(
            &self,
            _ctx: &mut Context,
            _html: &str,
            _search_url: &str,
        ) -> Result<Vec<String>, CrawlerError> {
            unreachable!("crawl() is overridden")
        }

        async fn parse_detail_page(
            &self,
            _ctx: &mut Context,
            _html: &str,
            _detail_url: &str,
        ) -> Result<CrawlerData, CrawlerError> {
            unreachable!("crawl() is overridden")
        }

        async fn crawl(&self, input: &CrawlerInput) -> Result<CrawlerData, CrawlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let adapted = self.adapt_input(input);
            self.seen_numbers.lock().unwrap().push(adapted.number.clone());
            tokio::time::sleep(self.delay).await;
            match &self.data {
                Some(data) => Ok(data.clone()),
                None => Err(CrawlerError::Parse("fake failure".into())),
            }
        }
    }

    struct TestHarness {
        engine: ScrapeEngine,
        calls: HashMap<Website, Arc<AtomicU32>>,
        seen: HashMap<Website, Arc<std::sync::Mutex<Vec<String>>>>,
    }

    fn harness(
        priorities: FieldPriorities,
        site_data: Vec<(Website, Option<CrawlerData>, Duration)>,
    ) -> TestHarness {
        let config = Config::builder()
            .with_retry(0)
            .with_timeout(Duration::from_secs(2))
            .with_field_priorities(priorities)
            .build();
        let events = Arc::new(EventBus::silent());
        let client = Arc::new(AvWebClient::with_events(&config, events.clone()).unwrap());

        let mut crawlers: HashMap<Website, Arc<dyn SiteCrawler>> = HashMap::new();
        let mut calls = HashMap::new();
        let mut seen = HashMap::new();
        for (site, data, delay) in site_data {
            let counter = Arc::new(AtomicU32::new(0));
            let numbers = Arc::new(std::sync::Mutex::new(Vec::new()));
            calls.insert(site, counter.clone());
            seen.insert(site, numbers.clone());
            crawlers.insert(
                site,
                Arc::new(FakeCrawler {
                    site,
                    client: client.clone(),
                    data,
                    delay,
                    calls: counter,
                    seen_numbers: numbers,
                }),
            );
        }
        TestHarness {
            engine: ScrapeEngine::from_parts(config, client, crawlers, events),
            calls,
            seen,
        }
    }

    fn sample(number: &str, title: &str, release: &str) -> CrawlerData {
        CrawlerData {
            number: number.to_string(),
            title: title.to_string(),
            release: release.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn merges_per_field_by_priority() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Number, vec![Website::Dmm, Website::Javbus]);
        priorities.set(Field::Title, vec![Website::Dmm, Website::Javbus]);
        priorities.set(Field::Release, vec![Website::Javbus, Website::Dmm]);

        let harness = harness(
            priorities,
            vec![
                (
                    Website::Dmm,
                    Some(sample("SSIS-497", "dmm title", "")),
                    Duration::ZERO,
                ),
                (
                    Website::Javbus,
                    Some(sample("SSIS-497", "javbus title", "2022-08-09")),
                    Duration::ZERO,
                ),
            ],
        );

        let input = CrawlerInput::from_number("SSIS-497");
        let record = harness.engine.call_crawlers(&input).await.unwrap();
        assert_eq!(record.data.title, "dmm title");
        assert_eq!(record.source_of(Field::Title), Some(Website::Dmm));
        assert_eq!(record.data.release, "2022-08-09");
        assert_eq!(record.source_of(Field::Release), Some(Website::Javbus));
        assert_eq!(record.data.year, "2022");
    }

    #[tokio::test]
    async fn all_sites_failed_yields_none_and_input_is_untouched() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Dmm, Website::Mgstage]);

        let harness = harness(
            priorities,
            vec![
                (Website::Dmm, None, Duration::ZERO),
                (Website::Mgstage, None, Duration::ZERO),
            ],
        );

        let mut input = CrawlerInput::from_number("200GANA-3327");
        input.short_number = "GANA-3327".to_string();
        let before = input.clone();

        assert!(harness.engine.call_crawlers(&input).await.is_none());
        assert_eq!(input, before, "shared input must survive failures");
    }

    #[tokio::test]
    async fn sites_see_their_own_number_forms() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Dmm, Website::Mgstage]);

        let harness = harness(
            priorities,
            vec![
                (
                    Website::Dmm,
                    Some(sample("GANA-3327", "dmm", "")),
                    Duration::ZERO,
                ),
                (
                    Website::Mgstage,
                    Some(sample("200GANA-3327", "mgs", "")),
                    Duration::ZERO,
                ),
            ],
        );

        let mut input = CrawlerInput::from_number("200GANA-3327");
        input.short_number = "GANA-3327".to_string();
        harness.engine.call_crawlers(&input).await.unwrap();

        assert_eq!(
            *harness.seen[&Website::Dmm].lock().unwrap(),
            vec!["GANA-3327"]
        );
        assert_eq!(
            *harness.seen[&Website::Mgstage].lock().unwrap(),
            vec!["200GANA-3327"]
        );
        assert_eq!(input.number, "200GANA-3327");
    }

    #[tokio::test]
    async fn same_number_lookups_share_one_crawl() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Javbus]);

        let harness = harness(
            priorities,
            vec![(
                Website::Javbus,
                Some(sample("ABC-123", "title", "")),
                Duration::from_millis(100),
            )],
        );
        let engine = Arc::new(harness.engine);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .call_crawlers(&CrawlerInput::from_number("ABC-123"))
                    .await
            }));
        }
        for task in tasks {
            let record = task.await.unwrap().unwrap();
            assert_eq!(record.data.title, "title");
        }
        assert_eq!(harness.calls[&Website::Javbus].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_numbers_do_not_cascade_retries() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Javbus]);

        let harness = harness(
            priorities,
            vec![(Website::Javbus, None, Duration::ZERO)],
        );

        let input = CrawlerInput::from_number("DEF-456");
        assert!(harness.engine.call_crawlers(&input).await.is_none());
        assert!(harness.engine.call_crawlers(&input).await.is_none());
        assert_eq!(harness.calls[&Website::Javbus].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn number_falls_back_to_input_when_sites_leave_it_empty() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Javbus]);
        priorities.set(Field::Number, vec![Website::Javbus]);

        let harness = harness(
            priorities,
            vec![(
                Website::Javbus,
                Some(sample("", "title only", "")),
                Duration::ZERO,
            )],
        );

        let record = harness
            .engine
            .call_crawlers(&CrawlerInput::from_number("XYZ-999"))
            .await
            .unwrap();
        assert_eq!(record.data.number, "XYZ-999");
    }
}
