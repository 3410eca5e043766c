//! Request kinds and their wire serialization.

use super::catalog::{Category, Param};
use super::set::ParameterSet;
use crate::config::TrackingConfig;
use serde::{Deserialize, Serialize};

/// Protocol version sent in the leading `p=` field
pub const LIBRARY_VERSION: &str = "470";

/// Path segment of the collector endpoint
const ENDPOINT_SUFFIX: &str = "wt";

const GENERAL_KEYS: &[Param] = &[
    Param::EverId,
    Param::AdvertiserId,
    Param::ForceNewSession,
    Param::AppFirstStart,
    Param::CurrentTime,
    Param::Timezone,
    Param::Language,
    Param::CustomerId,
    Param::ActionName,
    Param::OrderTotal,
    Param::OrderNumber,
    Param::Product,
    Param::ProductCost,
    Param::Currency,
    Param::ProductCount,
    Param::ProductStatus,
    Param::VoucherValue,
    Param::Advertisement,
    Param::AdvertisementAction,
    Param::InternalSearch,
    Param::Email,
    Param::EmailRid,
    Param::Newsletter,
    Param::FirstName,
    Param::LastName,
    Param::Phone,
    Param::Gender,
    Param::Birthday,
    Param::City,
    Param::Country,
    Param::Zip,
    Param::Street,
    Param::StreetNumber,
    Param::MediaFile,
    Param::MediaAction,
    Param::MediaPosition,
    Param::MediaLength,
    Param::MediaBandwidth,
    Param::MediaVolume,
    Param::MediaMuted,
    Param::MediaTimestamp,
    Param::Sampling,
    Param::IpAddress,
    Param::UserAgent,
    Param::PageUrl,
];

const GENERAL_CATEGORIES: &[Category] = &[
    Category::Ecommerce,
    Category::Advertisement,
    Category::Page,
    Category::Session,
    Category::Action,
    Category::ProductCategory,
    Category::PageCategory,
    Category::UserCategory,
    Category::MediaCategory,
];

/// Identity-resolution fields that can ride along on a general request
const IDENTITY_MERGEABLE_KEYS: &[Param] = &[
    Param::CdbEmailMd5,
    Param::CdbEmailSha256,
    Param::CdbPhoneMd5,
    Param::CdbPhoneSha256,
    Param::CdbAddressMd5,
    Param::CdbAddressSha256,
    Param::CdbAndroidId,
    Param::CdbIosAdId,
    Param::CdbWindowsAdId,
    Param::CdbFacebookId,
    Param::CdbTwitterId,
    Param::CdbGooglePlusId,
    Param::CdbLinkedinId,
];

const IDENTITY_KEYS: &[Param] = &[
    Param::EverId,
    Param::CdbEmailMd5,
    Param::CdbEmailSha256,
    Param::CdbPhoneMd5,
    Param::CdbPhoneSha256,
    Param::CdbAddressMd5,
    Param::CdbAddressSha256,
    Param::CdbAndroidId,
    Param::CdbIosAdId,
    Param::CdbWindowsAdId,
    Param::CdbFacebookId,
    Param::CdbTwitterId,
    Param::CdbGooglePlusId,
    Param::CdbLinkedinId,
];

const IDENTITY_CATEGORIES: &[Category] = &[Category::Identity];

const INSTALL_KEYS: &[Param] = &[
    Param::InstallTrackId,
    Param::InstallAdId,
    Param::InstallClickId,
    Param::UserAgent,
];

const EXCEPTION_KEYS: &[Param] = &[Param::ActionName];

const EXCEPTION_CATEGORIES: &[Category] = &[Category::Action];

/// Closed set of request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Page and action events
    General,
    /// Identity-resolution (cross-device bridge) event
    Identity,
    /// Install attribution, sent to a separate endpoint
    Install,
    /// Exception report
    Exception,
}

impl RequestKind {
    pub fn scalar_keys(&self) -> &'static [Param] {
        match self {
            RequestKind::General => GENERAL_KEYS,
            RequestKind::Identity => IDENTITY_KEYS,
            RequestKind::Install => INSTALL_KEYS,
            RequestKind::Exception => EXCEPTION_KEYS,
        }
    }

    pub fn categories(&self) -> &'static [Category] {
        match self {
            RequestKind::General => GENERAL_CATEGORIES,
            RequestKind::Identity => IDENTITY_CATEGORIES,
            RequestKind::Install => &[],
            RequestKind::Exception => EXCEPTION_CATEGORIES,
        }
    }

    /// Whether `&eor=1` closes the request
    pub fn appends_terminator(&self) -> bool {
        !matches!(self, RequestKind::Install)
    }

    /// Base URL including the trailing `?`
    pub fn base_url(&self, config: &TrackingConfig) -> String {
        match self {
            RequestKind::Install => format!("{}?", config.install_attribution_url),
            _ => format!(
                "{}/{}/{}?",
                config.track_domain.trim_end_matches('/'),
                config.track_id,
                ENDPOINT_SUFFIX
            ),
        }
    }

    /// Leading protocol-version field, `None` for kinds without one
    pub fn version_field(&self, params: &ParameterSet) -> Option<String> {
        let field = |p: Param| params.get(p).unwrap_or("");
        match self {
            RequestKind::General => Some(format!(
                "p={},{},0,{},{},0,{},0,0,0",
                LIBRARY_VERSION,
                urlencoding::encode(field(Param::ScreenName)),
                field(Param::ScreenResolution),
                field(Param::ScreenDepth),
                field(Param::Timestamp)
            )),
            RequestKind::Identity => Some(format!("p={},0", LIBRARY_VERSION)),
            RequestKind::Install => None,
            RequestKind::Exception => Some(format!(
                "p={},,0,,,0,{},0,0,0",
                LIBRARY_VERSION,
                field(Param::Timestamp)
            )),
        }
    }
}

/// A fully composed request, ready to be serialized against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRequest {
    pub kind: RequestKind,
    pub parameters: ParameterSet,
    /// Identity-resolution fields merged onto a general request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ParameterSet>,
}

impl TrackingRequest {
    pub fn new(kind: RequestKind, parameters: ParameterSet) -> Self {
        Self {
            kind,
            parameters,
            identity: None,
        }
    }

    /// Link identity-resolution fields onto this request.
    ///
    /// Only general requests carry merged fields; other kinds ignore them.
    pub fn with_identity(mut self, identity: ParameterSet) -> Self {
        if self.kind == RequestKind::General {
            self.identity = Some(identity);
        } else {
            tracing::warn!(kind = ?self.kind, "Identity fields can only be merged onto general requests");
        }
        self
    }

    /// Serialize to the request string stored in the durable queue.
    pub fn to_url(&self, config: &TrackingConfig) -> String {
        let mut url = self.kind.base_url(config);
        let mut first = true;

        if let Some(version) = self.kind.version_field(&self.parameters) {
            url.push_str(&version);
            first = false;
        }

        append_fields(
            &mut url,
            &mut first,
            &self.parameters,
            self.kind.scalar_keys(),
            self.kind.categories(),
        );

        if let Some(identity) = &self.identity {
            append_fields(
                &mut url,
                &mut first,
                identity,
                IDENTITY_MERGEABLE_KEYS,
                IDENTITY_CATEGORIES,
            );
        }

        if self.kind.appends_terminator() {
            url.push_str("&eor=1");
        }
        url
    }
}

fn append_fields(
    url: &mut String,
    first: &mut bool,
    parameters: &ParameterSet,
    keys: &[Param],
    categories: &[Category],
) {
    for param in keys {
        let (Some(key), Some(value)) = (param.wire_key(), parameters.get(*param)) else {
            continue;
        };
        push_pair(url, first, key, value);
    }

    for category in categories {
        let Some(values) = parameters.category(*category) else {
            continue;
        };
        for (index, value) in values {
            let key = format!("{}{}", category.wire_prefix(), index);
            push_pair(url, first, &key, value);
        }
    }
}

fn push_pair(url: &mut String, first: &mut bool, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    if !*first {
        url.push('&');
    }
    *first = false;
    url.push_str(key);
    url.push('=');
    url.push_str(&urlencoding::encode(value));
}
