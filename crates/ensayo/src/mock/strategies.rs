//! Proptest Strategies for the Mock Application
//!
//! Generate the states a test can leave the application in, and the intents
//! it can dispatch, for property-based tests of session reuse and intent
//! counting.

use crate::intent::Intent;
use crate::mock::MockEffect;

#[cfg(feature = "proptest")]
use proptest::prelude::*;

/// Components used by the generated intents
pub const COMPONENTS: [&str; 3] = [
    "org.chromium.chrome.browser.settings.SettingsActivity",
    "org.chromium.chrome.browser.ChromeTabbedActivity",
    "org.chromium.chrome.browser.customtabs.CustomTabActivity",
];

#[cfg(feature = "proptest")]
fn any_url() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("about:blank".to_string()),
        Just("chrome://settings".to_string()),
        "[a-z]{1,8}".prop_map(|host| format!("https://{host}.test/")),
    ]
}

/// Generate a sequence of page effects leaving the application in an
/// arbitrary end state (extra pages, backgrounded, navigated away)
#[cfg(feature = "proptest")]
pub fn any_end_state() -> impl Strategy<Value = Vec<MockEffect>> {
    prop::collection::vec(
        prop_oneof![
            3 => any_url().prop_map(MockEffect::Navigate),
            2 => any_url().prop_map(MockEffect::OpenPage),
            1 => Just(MockEffect::ClosePage),
            1 => Just(MockEffect::Background),
        ],
        0..8,
    )
}

/// Generate an intent targeting one of [`COMPONENTS`]
#[cfg(feature = "proptest")]
pub fn any_intent() -> impl Strategy<Value = Intent> {
    (0..COMPONENTS.len(), proptest::option::of("[A-Za-z]{1,12}")).prop_map(|(i, fragment)| {
        let intent = Intent::new(COMPONENTS[i]);
        match fragment {
            Some(fragment) => intent.with_extra("show_fragment", fragment),
            None => intent,
        }
    })
}

/// Generate a batch of intents
#[cfg(feature = "proptest")]
pub fn intent_batch() -> impl Strategy<Value = Vec<Intent>> {
    prop::collection::vec(any_intent(), 0..16)
}

// Non-proptest versions for use without the feature

/// Fixed end states covering every page effect
#[must_use]
pub fn standard_end_states() -> Vec<Vec<MockEffect>> {
    vec![
        Vec::new(),
        vec![MockEffect::Navigate("chrome://settings".into())],
        vec![MockEffect::OpenPage("https://a.test/".into())],
        vec![
            MockEffect::OpenPage("https://a.test/".into()),
            MockEffect::OpenPage("https://b.test/".into()),
        ],
        vec![MockEffect::ClosePage],
        vec![MockEffect::Background],
    ]
}

/// Fixed intents, one per component
#[must_use]
pub fn standard_intents() -> Vec<Intent> {
    COMPONENTS.iter().map(|c| Intent::new(*c)).collect()
}
