//! Well-known envelope context tag keys.
//!
//! Every envelope carries a flat string map of these tags; the ingestion
//! service indexes them for correlation and service-map construction.

/// Trace id shared by every envelope derived from one distributed operation.
pub const OPERATION_ID: &str = "ai.operation.id";

/// Span id of the direct parent of the telemetry item.
pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";

/// Human readable name of the root operation.
pub const OPERATION_NAME: &str = "ai.operation.name";

/// Logical service name of the emitting process.
pub const CLOUD_ROLE: &str = "ai.cloud.role";

/// Instance (host) the emitting process runs on.
pub const CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";

/// Authenticated or anonymous end-user id.
pub const USER_ID: &str = "ai.user.id";

/// User agent string of the calling client.
pub const USER_AGENT: &str = "ai.user.userAgent";

/// Client IP address the request originated from.
pub const LOCATION_IP: &str = "ai.location.ip";

/// Version of the instrumented application.
pub const APPLICATION_VER: &str = "ai.application.ver";

/// Version of this exporter, prefixed with its language marker.
pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";

/// Root operation id injected by the legacy correlation bridge.
pub const LEGACY_ROOT_ID: &str = "ai_legacyRootID";
