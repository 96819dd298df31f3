pub mod aggregate;
pub mod cache;
pub mod error;
pub mod flow;
pub mod guard;
pub mod service;
pub mod session;
pub mod sync;
pub mod validation;

// Re-export commonly used types
pub use aggregate::{
    AdditionalDriver, Address, BodyType, Coverages, Deductible, Premium, PrimaryDriver,
    QuoteAggregate, Relationship, Vehicle,
};
pub use cache::{CacheRead, QuoteCache};
pub use error::{FlowError, Result};
pub use flow::{Flow, FlowSession, FlowStore, MemoryFlowStore};
pub use guard::{GuardContext, GuardDecision, RouteGuard};
pub use service::{
    DriverInput, InProcessQuoteService, NewQuoteRequest, PaymentCard, QuoteService, VehicleInput,
};
pub use session::{QuoteSessionClient, WizardStep};
pub use sync::{PricingSync, PricingView, QUIET_INTERVAL, SyncPhase};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{new_quote_request, sample_coverages};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::advance;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_wizard_walkthrough() {
        let flow_session = FlowSession::in_memory();
        flow_session.set_active_flow(Flow::Modern);

        let service: Arc<dyn QuoteService> = Arc::new(InProcessQuoteService::new());
        let cache = QuoteCache::new();
        let client = QuoteSessionClient::new(service.clone(), cache.clone());

        // Every protected step of the chosen flow is allowed.
        let mut step = WizardStep::PrimaryDriver;
        loop {
            let guard = RouteGuard::new(flow_session.clone(), Flow::Modern, "/");
            assert!(guard.evaluate(&step.path(Flow::Modern)).is_allowed());
            match step.next() {
                Some(next) => step = next,
                None => break,
            }
        }

        // Step 1: create the quote.
        let quote = client.start_quote(new_quote_request()).await.unwrap();
        let number = quote.quote_number.clone();
        assert!(number.starts_with("DZ"));
        assert!(quote.premium.total > 0.0);

        // Coverage step: prime the synchronizer from the fetched aggregate,
        // then drag through a few selections.
        let loaded = client.load(&number).await.unwrap();
        let sync = PricingSync::spawn(service, cache.clone(), number.clone());
        sync.prime(&loaded);
        settle().await;

        let mut coverages = sample_coverages();
        sync.edit(coverages.clone());
        settle().await;
        coverages.roadside_assistance = true;
        sync.edit(coverages.clone());
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;

        // The synchronizer refreshed the cache; the review step reads the
        // repriced aggregate without another fetch.
        let reviewed = cache.read(&number).into_aggregate().unwrap();
        assert!(reviewed.coverages.roadside_assistance);
        assert!(reviewed.premium.total > quote.premium.total);

        let view = sync.view();
        assert_eq!(view.borrow().phase, SyncPhase::Idle);
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(reviewed.premium.total)
        );

        // Bind and leave the flow.
        let policy = client
            .bind(
                &number,
                PaymentCard {
                    number: "4111 1111 1111 1111".to_string(),
                    expiry_month: 8,
                    expiry_year: 2028,
                    cvv: "123".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(policy.starts_with("POL"));

        flow_session.clear_active_flow();
        let guard = RouteGuard::new(flow_session, Flow::Modern, "/");
        assert!(!guard.evaluate("/modern/review").is_allowed());
    }

    #[tokio::test]
    async fn direct_open_without_flow_is_redirected_before_render() {
        let flow_session = FlowSession::in_memory();
        let guard = RouteGuard::new(flow_session, Flow::Modern, "/");

        // No step content may be produced for a denied evaluation, so the
        // decision itself is all a handler gets to act on.
        match guard.evaluate("/modern/coverage") {
            GuardDecision::Denied(ctx) => {
                assert_eq!(ctx.fallback_path, "/");
                assert_eq!(ctx.actual_flow, None);
                assert_eq!(ctx.expected_flow, Flow::Modern);
            }
            GuardDecision::Allowed => panic!("rendered a step with no active flow"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refetch_and_recalculation_converge() {
        let service: Arc<dyn QuoteService> = Arc::new(InProcessQuoteService::new());
        let cache = QuoteCache::new();
        let client = QuoteSessionClient::new(service.clone(), cache.clone());

        let quote = client.start_quote(new_quote_request()).await.unwrap();
        let number = quote.quote_number.clone();

        let sync = PricingSync::spawn(service, cache.clone(), number.clone());
        sync.prime(&quote);
        sync.edit(sample_coverages());
        settle().await;

        // A navigation-triggered refetch while the debounce timer runs.
        cache.invalidate(&number);
        client.load(&number).await.unwrap();

        advance(Duration::from_millis(300)).await;
        settle().await;

        // The recalculation response overwrote the refetched entry; every
        // reader sees the repriced aggregate.
        let cached = cache.read(&number).into_aggregate().unwrap();
        assert!(cached.coverages.uninsured_motorist);
        assert!(cached.premium.total > quote.premium.total);
    }
}
