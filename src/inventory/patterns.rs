//! Keyword lists used by the confidence heuristics.

/// Corporate filler words that never identify a vendor
pub(crate) const VENDOR_STOPWORDS: &[&str] = &[
    "inc",
    "ltd",
    "llc",
    "corp",
    "co",
    "company",
    "corporation",
    "gmbh",
    "ag",
    "sa",
    "srl",
    "plc",
    "limited",
    "group",
    "international",
    "technology",
    "technologies",
    "systems",
    "electronics",
    "holdings",
];

pub(crate) const MAX_VENDOR_KEYWORDS: usize = 3;

/// Text hints that an HTTP endpoint belongs to a camera or recorder
pub(crate) const CAMERA_KEYWORDS: &[&str] = &[
    "camera",
    "ipcam",
    "webcam",
    "nvr",
    "dvr",
    "surveillance",
    "hikvision",
    "dahua",
    "axis",
    "reolink",
    "amcrest",
    "unifi",
    "ubiquiti",
    "foscam",
    "lorex",
    "annke",
    "vivotek",
];

/// Camera brands, matched against the OUI vendor name
pub(crate) const CAMERA_BRANDS: &[&str] = &[
    "hikvision",
    "dahua",
    "axis",
    "reolink",
    "amcrest",
    "unifi",
    "ubiquiti",
    "foscam",
    "lorex",
    "annke",
    "vivotek",
];

/// UPnP vocabulary of media devices, matched against SSDP evidence tokens
pub(crate) const MEDIA_KEYWORDS: &[&str] = &[
    "media",
    "mediaserver",
    "camera",
    "ipcamera",
    "nvr",
    "dvr",
    "av",
    "upnp",
];

/// HTTP status codes that show a live web UI (auth challenges included)
pub(crate) const HTTP_LIVE_STATUSES: &[u16] = &[200, 401, 403];
