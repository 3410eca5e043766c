//! Closed catalog of parameter keys and category maps.
//!
//! Every scalar parameter has a configuration name (used in TOML and in the
//! staging file) and, unless it only feeds the version field, a wire key.

use std::fmt;

macro_rules! params {
    ($($variant:ident => ($name:literal, $wire:expr)),+ $(,)?) => {
        /// Scalar parameter keys
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Param {
            $($variant),+
        }

        impl Param {
            pub const ALL: &'static [Param] = &[$(Param::$variant),+];

            /// Name used in configuration files and the staging store
            pub fn name(&self) -> &'static str {
                match self {
                    $(Param::$variant => $name),+
                }
            }

            /// Key in the request URL; `None` for version-field inputs
            pub fn wire_key(&self) -> Option<&'static str> {
                match self {
                    $(Param::$variant => $wire),+
                }
            }
        }
    };
}

params! {
    // Version-field inputs
    ScreenName => ("screen_name", None),
    ScreenResolution => ("screen_resolution", None),
    ScreenDepth => ("screen_depth", None),
    Timestamp => ("timestamp", None),

    // Device and session
    EverId => ("ever_id", Some("eid")),
    AdvertiserId => ("advertiser_id", Some("geid")),
    ForceNewSession => ("force_new_session", Some("fns")),
    AppFirstStart => ("app_first_start", Some("one")),
    CurrentTime => ("current_time", Some("mts")),
    Timezone => ("timezone", Some("tz")),
    Language => ("language", Some("la")),
    CustomerId => ("customer_id", Some("cd")),
    ActionName => ("action_name", Some("ct")),

    // Orders and products
    OrderTotal => ("order_total", Some("ov")),
    OrderNumber => ("order_number", Some("oi")),
    Product => ("product", Some("ba")),
    ProductCost => ("product_cost", Some("co")),
    Currency => ("currency", Some("cr")),
    ProductCount => ("product_count", Some("qn")),
    ProductStatus => ("product_status", Some("st")),
    VoucherValue => ("voucher_value", Some("cb563")),

    // Campaigns and search
    Advertisement => ("advertisement", Some("mc")),
    AdvertisementAction => ("advertisement_action", Some("mca")),
    InternalSearch => ("internal_search", Some("is")),

    // User fields
    Email => ("email", Some("uc700")),
    EmailRid => ("email_rid", Some("uc701")),
    Newsletter => ("newsletter", Some("uc702")),
    FirstName => ("first_name", Some("uc703")),
    LastName => ("last_name", Some("uc704")),
    Phone => ("phone", Some("uc705")),
    Gender => ("gender", Some("uc706")),
    Birthday => ("birthday", Some("uc707")),
    City => ("city", Some("uc708")),
    Country => ("country", Some("uc709")),
    Zip => ("zip", Some("uc710")),
    Street => ("street", Some("uc711")),
    StreetNumber => ("street_number", Some("uc712")),

    // Media
    MediaFile => ("media_file", Some("mi")),
    MediaAction => ("media_action", Some("mk")),
    MediaPosition => ("media_position", Some("mt1")),
    MediaLength => ("media_length", Some("mt2")),
    MediaBandwidth => ("media_bandwidth", Some("bw")),
    MediaVolume => ("media_volume", Some("vol")),
    MediaMuted => ("media_muted", Some("mut")),
    MediaTimestamp => ("media_timestamp", Some("x")),

    // Transport hints
    Sampling => ("sampling", Some("ps")),
    IpAddress => ("ip_address", Some("X-WT-IP")),
    UserAgent => ("user_agent", Some("X-WT-UA")),
    PageUrl => ("page_url", Some("pu")),

    // Install attribution
    InstallTrackId => ("install_track_id", Some("trackid")),
    InstallAdId => ("install_ad_id", Some("aid")),
    InstallClickId => ("install_click_id", Some("clickid")),

    // Identity resolution
    CdbEmailMd5 => ("cdb_email_md5", Some("cdb1")),
    CdbEmailSha256 => ("cdb_email_sha256", Some("cdb2")),
    CdbPhoneMd5 => ("cdb_phone_md5", Some("cdb3")),
    CdbPhoneSha256 => ("cdb_phone_sha256", Some("cdb4")),
    CdbAddressMd5 => ("cdb_address_md5", Some("cdb5")),
    CdbAddressSha256 => ("cdb_address_sha256", Some("cdb6")),
    CdbAndroidId => ("cdb_android_id", Some("cdb7")),
    CdbIosAdId => ("cdb_ios_ad_id", Some("cdb8")),
    CdbWindowsAdId => ("cdb_windows_ad_id", Some("cdb9")),
    CdbFacebookId => ("cdb_facebook_id", Some("cdb10")),
    CdbTwitterId => ("cdb_twitter_id", Some("cdb11")),
    CdbGooglePlusId => ("cdb_google_plus_id", Some("cdb12")),
    CdbLinkedinId => ("cdb_linkedin_id", Some("cdb13")),
}

impl Param {
    /// Look up a parameter by its configuration name
    pub fn from_name(name: &str) -> Option<Param> {
        Param::ALL.iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Indexed category maps, serialized as `&{prefix}{index}={value}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Ecommerce,
    Advertisement,
    Page,
    Session,
    Action,
    ProductCategory,
    PageCategory,
    UserCategory,
    MediaCategory,
    Identity,
}

impl Category {
    pub const ALL: &'static [Category] = &[
        Category::Ecommerce,
        Category::Advertisement,
        Category::Page,
        Category::Session,
        Category::Action,
        Category::ProductCategory,
        Category::PageCategory,
        Category::UserCategory,
        Category::MediaCategory,
        Category::Identity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Ecommerce => "ecommerce",
            Category::Advertisement => "advertisement",
            Category::Page => "page",
            Category::Session => "session",
            Category::Action => "action",
            Category::ProductCategory => "product_category",
            Category::PageCategory => "page_category",
            Category::UserCategory => "user_category",
            Category::MediaCategory => "media_category",
            Category::Identity => "identity",
        }
    }

    /// Wire prefix placed before the index
    pub fn wire_prefix(&self) -> &'static str {
        match self {
            Category::Ecommerce => "cb",
            Category::Advertisement => "cc",
            Category::Page => "cp",
            Category::Session => "cs",
            Category::Action => "ck",
            Category::ProductCategory => "ca",
            Category::PageCategory => "cg",
            Category::UserCategory => "uc",
            Category::MediaCategory => "mg",
            Category::Identity => "cdb",
        }
    }

    pub fn from_name(name: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_and_wire_keys_are_unique() {
        let names: HashSet<_> = Param::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), Param::ALL.len());

        let wire: Vec<_> = Param::ALL.iter().filter_map(|p| p.wire_key()).collect();
        let unique: HashSet<_> = wire.iter().collect();
        assert_eq!(unique.len(), wire.len());
    }

    #[test]
    fn test_from_name_roundtrip() {
        for param in Param::ALL {
            assert_eq!(Param::from_name(param.name()), Some(*param));
        }
        for category in Category::ALL {
            assert_eq!(Category::from_name(category.name()), Some(*category));
        }
        assert_eq!(Param::from_name("nope"), None);
    }

    #[test]
    fn test_version_field_inputs_have_no_wire_key() {
        assert_eq!(Param::ScreenName.wire_key(), None);
        assert_eq!(Param::Timestamp.wire_key(), None);
        assert_eq!(Param::EverId.wire_key(), Some("eid"));
        assert_eq!(Category::Ecommerce.wire_prefix(), "cb");
    }
}
