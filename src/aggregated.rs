//! Multi-peer façade for one extension.
//!
//! When more than one server definition claims an extension, document
//! bindings talk to this façade instead of a single session. It forwards a
//! logical connect to every underlying session and merges their capability
//! views; per-feature fan-out stays with the calling feature code, which
//! asks for the sessions advertising that feature.

use crate::definition::{advertises, ServerDefinition};
use crate::document::Document;
use crate::error::SessionError;
use crate::session::Session;
use crate::timeouts::FeatureKind;
use lsp_types::ServerCapabilities;
use std::sync::Arc;

pub struct AggregatedSession {
    /// Registration order; the first entry wins scalar capability ties.
    entries: Vec<(Arc<ServerDefinition>, Arc<Session>)>,
}

impl AggregatedSession {
    pub fn new(entries: Vec<(Arc<ServerDefinition>, Arc<Session>)>) -> Self {
        Self { entries }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.entries.iter().map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start every underlying session and connect the document to each,
    /// returning the merged capability view.
    ///
    /// A failing member is skipped (its error is reported through its own
    /// listener hook); the call only errors when every member failed.
    pub async fn connect_all(
        &self,
        document: &Arc<Document>,
    ) -> Result<ServerCapabilities, SessionError> {
        let mut merged: Option<ServerCapabilities> = None;
        let mut last_error = None;

        for (definition, session) in &self.entries {
            let capabilities = match session.capabilities().await {
                Ok(capabilities) => capabilities,
                Err(error) => {
                    tracing::warn!(
                        server = definition.name(),
                        error = %error,
                        "aggregated member failed to negotiate"
                    );
                    last_error = Some(error);
                    continue;
                }
            };
            if let Err(error) = session.connect(document).await {
                last_error = Some(error);
                continue;
            }
            merged = Some(match merged.take() {
                None => capabilities,
                Some(base) => merge_capabilities(base, capabilities),
            });
        }

        match merged {
            Some(capabilities) => Ok(capabilities),
            None => Err(last_error.unwrap_or_else(|| SessionError::NegotiationFailed {
                server: "aggregated".to_string(),
                reason: "no sessions to aggregate".to_string(),
            })),
        }
    }

    /// The sessions whose negotiated capabilities advertise a feature;
    /// feature code fans its request out to these.
    pub fn sessions_with(&self, feature: FeatureKind) -> Vec<Arc<Session>> {
        self.entries
            .iter()
            .filter(|(_, session)| {
                session
                    .capabilities_cached()
                    .map(|caps| advertises(&caps, feature))
                    .unwrap_or(false)
            })
            .map(|(_, session)| session.clone())
            .collect()
    }
}

/// First non-null wins for scalar capability areas; trigger-character lists
/// are unioned.
fn merge_capabilities(
    mut base: ServerCapabilities,
    other: ServerCapabilities,
) -> ServerCapabilities {
    match (base.completion_provider.as_mut(), other.completion_provider) {
        (Some(into), Some(from)) => {
            union_triggers(&mut into.trigger_characters, from.trigger_characters);
        }
        (None, Some(from)) => base.completion_provider = Some(from),
        _ => {}
    }
    match (
        base.signature_help_provider.as_mut(),
        other.signature_help_provider,
    ) {
        (Some(into), Some(from)) => {
            union_triggers(&mut into.trigger_characters, from.trigger_characters);
        }
        (None, Some(from)) => base.signature_help_provider = Some(from),
        _ => {}
    }

    base.hover_provider = base.hover_provider.or(other.hover_provider);
    base.definition_provider = base.definition_provider.or(other.definition_provider);
    base.references_provider = base.references_provider.or(other.references_provider);
    base.document_symbol_provider = base
        .document_symbol_provider
        .or(other.document_symbol_provider);
    base.document_formatting_provider = base
        .document_formatting_provider
        .or(other.document_formatting_provider);
    base.document_range_formatting_provider = base
        .document_range_formatting_provider
        .or(other.document_range_formatting_provider);
    base.code_action_provider = base.code_action_provider.or(other.code_action_provider);
    base.rename_provider = base.rename_provider.or(other.rename_provider);
    base.diagnostic_provider = base.diagnostic_provider.or(other.diagnostic_provider);
    base.text_document_sync = base.text_document_sync.or(other.text_document_sync);
    base
}

fn union_triggers(into: &mut Option<Vec<String>>, from: Option<Vec<String>>) {
    let Some(from) = from else {
        return;
    };
    let into = into.get_or_insert_with(Vec::new);
    for trigger in from {
        if !into.contains(&trigger) {
            into.push(trigger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{CompletionOptions, HoverProviderCapability};

    fn caps(triggers: &[&str], hover: bool) -> ServerCapabilities {
        ServerCapabilities {
            completion_provider: Some(CompletionOptions {
                trigger_characters: Some(triggers.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }),
            hover_provider: hover.then_some(HoverProviderCapability::Simple(true)),
            ..Default::default()
        }
    }

    #[test]
    fn trigger_lists_are_unioned() {
        let merged = merge_capabilities(caps(&[".", ":"], false), caps(&[":", "@"], true));
        let triggers = merged
            .completion_provider
            .unwrap()
            .trigger_characters
            .unwrap();
        assert_eq!(triggers, vec![".", ":", "@"]);
    }

    #[test]
    fn first_non_null_scalar_wins() {
        let first = ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(false)),
            ..Default::default()
        };
        let second = ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            ..Default::default()
        };
        let merged = merge_capabilities(first, second);
        assert!(matches!(
            merged.hover_provider,
            Some(HoverProviderCapability::Simple(false))
        ));
    }
}
