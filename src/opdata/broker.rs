use crate::core::{EditFlags, Result, SessionState};
use crate::schema::SchemaRegistry;
use crate::session::Session;
use crate::store::layout::RepoLayout;
use crate::subscription::{SubscriberEvent, SubscriptionKind, SubscriptionRegistry};
use crate::tree::edit::apply_set_with_origin;
use crate::tree::xpath::XPath;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Assembles operational (state) data into a session's working tree.
///
/// A read that needs state data parks the session in
/// WaitingForProviderData, queries every registered provider for the module,
/// and merges whatever arrives before the deadline. The session always comes
/// back in DataLoaded; the read is then answered from the merged tree.
pub struct OpDataBroker {
    subscriptions: Arc<SubscriptionRegistry>,
    timeout: Duration,
}

impl OpDataBroker {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, timeout: Duration) -> Self {
        Self {
            subscriptions,
            timeout,
        }
    }

    /// Query all providers of `module` and merge their answers. Returns the
    /// number of providers that answered in time.
    pub async fn assemble(
        &self,
        session: &mut Session,
        schemas: &SchemaRegistry,
        layout: &RepoLayout,
        module: &str,
    ) -> Result<usize> {
        let providers = self
            .subscriptions
            .snapshot(module, SubscriptionKind::OperationalData)
            .await;
        if providers.is_empty() {
            return Ok(0);
        }

        session.state = SessionState::WaitingForProviderData;
        let mut waiting = Vec::with_capacity(providers.len());
        for provider in &providers {
            let xpath = provider
                .xpath
                .as_ref()
                .map(|x| x.to_string())
                .unwrap_or_else(|| format!("/{}:", module));
            let (tx, rx) = oneshot::channel();
            match provider.deliver(SubscriberEvent::DataRequested { xpath, reply: tx }) {
                Ok(()) => waiting.push((provider.id, rx)),
                Err(err) => warn!(provider = provider.id, %err, "provider unreachable"),
            }
        }

        let datastore = session.datastore;
        let schema = schemas.get(module, None).await?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut answered = 0;

        // race every outstanding reply against the shared deadline; a slow
        // provider must not shadow answers that already arrived
        let mut pending: FuturesUnordered<_> = waiting
            .into_iter()
            .map(|(provider_id, rx)| async move { (provider_id, rx.await) })
            .collect();
        while !pending.is_empty() {
            let next = match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    // deadline: continue with whatever data has arrived
                    debug!(outstanding = pending.len(), "operational data wait timed out");
                    break;
                }
            };
            match next {
                (provider_id, Ok(Ok(values))) => {
                    let info = session
                        .working_set(datastore)
                        .get_or_load(schemas, layout, module)
                        .await?;
                    for value in &values {
                        let path = match XPath::parse(&value.xpath) {
                            Ok(path) => path,
                            Err(err) => {
                                warn!(provider = provider_id, %err, "provider value ignored");
                                continue;
                            }
                        };
                        if let Err(err) = apply_set_with_origin(
                            &mut info.tree,
                            &schema,
                            &path,
                            Some(&value.value),
                            EditFlags::default(),
                            value.origin_default,
                        ) {
                            warn!(provider = provider_id, %err, "provider value ignored");
                        }
                    }
                    answered += 1;
                }
                (provider_id, Ok(Err(err))) => {
                    warn!(provider = provider_id, %err, "provider reported an error");
                }
                (provider_id, Err(_)) => {
                    warn!(provider = provider_id, "provider dropped its reply");
                }
            }
        }

        session.state = SessionState::DataLoaded;
        Ok(answered)
    }
}
