use std::borrow::Cow;
use std::future::Future;

use rmcp::model::{Prompt, Resource, Tool};
use rmcp::service::ServiceError;
use rmcp::{Peer, RoleClient};
use serde::Serialize;

use mcpd_core::{CapabilityFlags, ServerSpec};

/// One aggregated list kind. The three implementations differ only in the
/// wire call, the capability bit, and whether public names are namespaced.
pub trait IndexKind: Send + Sync + 'static {
    type Item: Clone + Serialize + Send + Sync + 'static;

    const LABEL: &'static str;
    /// Tools and prompts take the `{server}.{name}` prefix; resources are
    /// addressed by URI and never renamed.
    const NAMESPACED: bool;

    fn original_name(item: &Self::Item) -> String;
    fn with_public_name(item: Self::Item, public: &str) -> Self::Item;
    fn capability_ok(caps: &CapabilityFlags) -> bool;
    fn exposed(spec: &ServerSpec, item: &Self::Item) -> bool;
    fn list(
        peer: &Peer<RoleClient>,
    ) -> impl Future<Output = Result<Vec<Self::Item>, ServiceError>> + Send;
}

pub struct ToolsKind;

impl IndexKind for ToolsKind {
    type Item = Tool;

    const LABEL: &'static str = "tools";
    const NAMESPACED: bool = true;

    fn original_name(item: &Self::Item) -> String {
        item.name.to_string()
    }

    fn with_public_name(mut item: Self::Item, public: &str) -> Self::Item {
        item.name = Cow::Owned(public.to_string());
        item
    }

    fn capability_ok(caps: &CapabilityFlags) -> bool {
        caps.tools
    }

    fn exposed(spec: &ServerSpec, item: &Self::Item) -> bool {
        spec.expose.allows_tool(item.name.as_ref())
    }

    async fn list(peer: &Peer<RoleClient>) -> Result<Vec<Self::Item>, ServiceError> {
        peer.list_all_tools().await
    }
}

pub struct ResourcesKind;

impl IndexKind for ResourcesKind {
    type Item = Resource;

    const LABEL: &'static str = "resources";
    const NAMESPACED: bool = false;

    fn original_name(item: &Self::Item) -> String {
        item.raw.uri.clone()
    }

    fn with_public_name(item: Self::Item, _public: &str) -> Self::Item {
        item
    }

    fn capability_ok(caps: &CapabilityFlags) -> bool {
        caps.resources
    }

    fn exposed(spec: &ServerSpec, item: &Self::Item) -> bool {
        spec.expose.allows_resource(&item.raw.uri)
    }

    async fn list(peer: &Peer<RoleClient>) -> Result<Vec<Self::Item>, ServiceError> {
        peer.list_all_resources().await
    }
}

pub struct PromptsKind;

impl IndexKind for PromptsKind {
    type Item = Prompt;

    const LABEL: &'static str = "prompts";
    const NAMESPACED: bool = true;

    fn original_name(item: &Self::Item) -> String {
        item.name.clone()
    }

    fn with_public_name(mut item: Self::Item, public: &str) -> Self::Item {
        item.name = public.to_string();
        item
    }

    fn capability_ok(caps: &CapabilityFlags) -> bool {
        caps.prompts
    }

    fn exposed(spec: &ServerSpec, item: &Self::Item) -> bool {
        spec.expose.allows_prompt(&item.name)
    }

    async fn list(peer: &Peer<RoleClient>) -> Result<Vec<Self::Item>, ServiceError> {
        peer.list_all_prompts().await
    }
}
