// Copyright 2025 The cinnabar developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use vodozemac::{olm::IdentityKeys, sas::EstablishedSas, Curve25519PublicKey};

use super::sas_state::MessageAuthenticationCode;
use crate::{
    types::DeviceData,
    utilities::{canonical_json, encode},
    verification::{
        event_enums::{CancelCode, MacContent, StartContent},
        Emoji,
    },
};

/// The identities involved in a SAS flow.
#[derive(Clone, Debug)]
pub struct SasIds {
    /// Our own user id.
    pub own_user_id: OwnedUserId,
    /// Our own device id.
    pub own_device_id: OwnedDeviceId,
    /// Our own long-term identity keys.
    pub own_identity_keys: std::sync::Arc<IdentityKeys>,
    /// The device on the other end of the flow.
    pub other_device: DeviceData,
}

/// Calculate the commitment for an accept event.
///
/// `SHA-256(our ephemeral public key || canonical JSON of the start
/// content)`, unpadded base64. Committing before the initiator reveals its
/// key stops us from choosing our key based on theirs.
pub fn calculate_commitment(public_key: Curve25519PublicKey, content: &StartContent) -> String {
    let content_string =
        canonical_json(content).expect("The start content can always be canonicalized");

    encode(
        Sha256::new()
            .chain_update(public_key.to_base64())
            .chain_update(content_string)
            .finalize(),
    )
}

/// The transcript info string used when creating MACs we send.
fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.own_user_id,
        first_device = ids.own_device_id,
        second_user = ids.other_device.user_id(),
        second_device = ids.other_device.device_id(),
        transaction_id = flow_id,
    )
}

/// The transcript info string used when checking MACs we received.
fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_device.user_id(),
        first_device = ids.other_device.device_id(),
        second_user = ids.own_user_id,
        second_device = ids.own_device_id,
        transaction_id = flow_id,
    )
}

/// Build the MAC event content for our own device key.
pub fn get_mac_content(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    mac_method: MessageAuthenticationCode,
) -> MacContent {
    let mut mac = BTreeMap::new();

    let key_id = format!("ed25519:{}", ids.own_device_id);
    let key = ids.own_identity_keys.ed25519.to_base64();
    let info = extra_mac_info_send(ids, flow_id);

    mac.insert(key_id.clone(), mac_method.calculate_mac(sas, &key, &format!("{info}{key_id}")));

    let mut keys: Vec<_> = mac.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();
    let keys = mac_method.calculate_mac(sas, &keys.join(","), &format!("{info}KEY_IDS"));

    MacContent { transaction_id: flow_id.into(), mac, keys }
}

/// Check a received MAC event and collect the devices it verifies.
///
/// Both the key-list MAC and every per-key MAC must verify; a single
/// mismatch fails the whole event with a `KeyMismatch` cancellation.
pub fn receive_mac_event(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    mac_method: MessageAuthenticationCode,
    content: &MacContent,
) -> Result<Vec<DeviceData>, CancelCode> {
    let mut verified_devices = Vec::new();

    let info = extra_mac_info_receive(ids, flow_id);

    trace!(
        sender = ?ids.other_device.user_id(),
        device_id = ?ids.other_device.device_id(),
        "Received a key.verification.mac event"
    );

    let mut keys: Vec<_> = content.mac.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();
    mac_method.verify_mac(sas, &keys.join(","), &format!("{info}KEY_IDS"), &content.keys)?;

    for (key_id, key_mac) in &content.mac {
        trace!(
            sender = ?ids.other_device.user_id(),
            key_id,
            "Checking a SAS MAC",
        );

        if let Some(key) = ids.other_device.keys.keys.get(key_id) {
            mac_method.verify_mac(sas, key, &format!("{info}{key_id}"), key_mac)?;
            verified_devices.push(ids.other_device.clone());
        } else {
            warn!(
                key_id,
                "A key id in the MAC event doesn't belong to the device being verified"
            );
        }
    }

    Ok(verified_devices)
}

/// The transcript info string the SAS bytes are derived under.
///
/// Binds both user ids, both device ids, both ephemeral keys and the
/// transaction id, so the derived bytes belong to this exact exchange.
fn extra_info_sas(
    ids: &SasIds,
    own_pubkey: Curve25519PublicKey,
    their_pubkey: Curve25519PublicKey,
    flow_id: &str,
    we_started: bool,
) -> String {
    let our_info = format!(
        "{}|{}|{}",
        ids.own_user_id,
        ids.own_device_id,
        own_pubkey.to_base64()
    );
    let their_info = format!(
        "{}|{}|{}",
        ids.other_device.user_id(),
        ids.other_device.device_id(),
        their_pubkey.to_base64()
    );

    let (first_info, second_info) =
        if we_started { (our_info, their_info) } else { (their_info, our_info) };

    let info = format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}");

    trace!("Generated a SAS extra info: {info}");

    info
}

/// The emoji form of the short authentication string: seven emoji picked by
/// 6-bit windows over the first 42 bits.
pub fn get_emoji(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> [Emoji; 7] {
    let bytes = sas.bytes(&extra_info_sas(
        ids,
        sas.our_public_key(),
        sas.their_public_key(),
        flow_id,
        we_started,
    ));

    bytes.emoji_indices().map(emoji_from_index)
}

/// The decimal form of the short authentication string: three groups of 13
/// bits, each offset by 1000.
pub fn get_decimal(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    we_started: bool,
) -> (u16, u16, u16) {
    let bytes = sas.bytes(&extra_info_sas(
        ids,
        sas.our_public_key(),
        sas.their_public_key(),
        flow_id,
        we_started,
    ));

    bytes.decimals()
}

/// Map a 6-bit index to its emoji, as defined by the spec's fixed table.
///
/// # Panics
///
/// The table has 64 entries; this panics for an index above 63.
fn emoji_from_index(index: u8) -> Emoji {
    match index {
        0 => Emoji { symbol: "🐶", description: "Dog" },
        1 => Emoji { symbol: "🐱", description: "Cat" },
        2 => Emoji { symbol: "🦁", description: "Lion" },
        3 => Emoji { symbol: "🐎", description: "Horse" },
        4 => Emoji { symbol: "🦄", description: "Unicorn" },
        5 => Emoji { symbol: "🐷", description: "Pig" },
        6 => Emoji { symbol: "🐘", description: "Elephant" },
        7 => Emoji { symbol: "🐰", description: "Rabbit" },
        8 => Emoji { symbol: "🐼", description: "Panda" },
        9 => Emoji { symbol: "🐓", description: "Rooster" },
        10 => Emoji { symbol: "🐧", description: "Penguin" },
        11 => Emoji { symbol: "🐢", description: "Turtle" },
        12 => Emoji { symbol: "🐟", description: "Fish" },
        13 => Emoji { symbol: "🐙", description: "Octopus" },
        14 => Emoji { symbol: "🦋", description: "Butterfly" },
        15 => Emoji { symbol: "🌷", description: "Flower" },
        16 => Emoji { symbol: "🌳", description: "Tree" },
        17 => Emoji { symbol: "🌵", description: "Cactus" },
        18 => Emoji { symbol: "🍄", description: "Mushroom" },
        19 => Emoji { symbol: "🌏", description: "Globe" },
        20 => Emoji { symbol: "🌙", description: "Moon" },
        21 => Emoji { symbol: "☁️", description: "Cloud" },
        22 => Emoji { symbol: "🔥", description: "Fire" },
        23 => Emoji { symbol: "🍌", description: "Banana" },
        24 => Emoji { symbol: "🍎", description: "Apple" },
        25 => Emoji { symbol: "🍓", description: "Strawberry" },
        26 => Emoji { symbol: "🌽", description: "Corn" },
        27 => Emoji { symbol: "🍕", description: "Pizza" },
        28 => Emoji { symbol: "🎂", description: "Cake" },
        29 => Emoji { symbol: "❤️", description: "Heart" },
        30 => Emoji { symbol: "😀", description: "Smiley" },
        31 => Emoji { symbol: "🤖", description: "Robot" },
        32 => Emoji { symbol: "🎩", description: "Hat" },
        33 => Emoji { symbol: "👓", description: "Glasses" },
        34 => Emoji { symbol: "🔧", description: "Spanner" },
        35 => Emoji { symbol: "🎅", description: "Santa" },
        36 => Emoji { symbol: "👍", description: "Thumbs Up" },
        37 => Emoji { symbol: "☂️", description: "Umbrella" },
        38 => Emoji { symbol: "⌛", description: "Hourglass" },
        39 => Emoji { symbol: "⏰", description: "Clock" },
        40 => Emoji { symbol: "🎁", description: "Gift" },
        41 => Emoji { symbol: "💡", description: "Light Bulb" },
        42 => Emoji { symbol: "📕", description: "Book" },
        43 => Emoji { symbol: "✏️", description: "Pencil" },
        44 => Emoji { symbol: "📎", description: "Paperclip" },
        45 => Emoji { symbol: "✂️", description: "Scissors" },
        46 => Emoji { symbol: "🔒", description: "Lock" },
        47 => Emoji { symbol: "🔑", description: "Key" },
        48 => Emoji { symbol: "🔨", description: "Hammer" },
        49 => Emoji { symbol: "☎️", description: "Telephone" },
        50 => Emoji { symbol: "🏁", description: "Flag" },
        51 => Emoji { symbol: "🚂", description: "Train" },
        52 => Emoji { symbol: "🚲", description: "Bicycle" },
        53 => Emoji { symbol: "✈️", description: "Aeroplane" },
        54 => Emoji { symbol: "🚀", description: "Rocket" },
        55 => Emoji { symbol: "🏆", description: "Trophy" },
        56 => Emoji { symbol: "⚽", description: "Ball" },
        57 => Emoji { symbol: "🎸", description: "Guitar" },
        58 => Emoji { symbol: "🎺", description: "Trumpet" },
        59 => Emoji { symbol: "🔔", description: "Bell" },
        60 => Emoji { symbol: "⚓", description: "Anchor" },
        61 => Emoji { symbol: "🎧", description: "Headphones" },
        62 => Emoji { symbol: "📁", description: "Folder" },
        63 => Emoji { symbol: "📌", description: "Pin" },
        _ => panic!("Trying to fetch an emoji outside the allowed range"),
    }
}

#[cfg(test)]
mod tests {
    use vodozemac::Curve25519PublicKey;

    use super::calculate_commitment;
    use crate::verification::event_enums::StartContent;

    #[test]
    fn commitment_is_deterministic_and_key_bound() {
        let content: StartContent = serde_json::from_value(serde_json::json!({
            "from_device": "XOWLHHFSWM",
            "transaction_id": "bYxBsirjUJO9osar6ST4i2M2NjrYLA7l",
            "method": "m.sas.v1",
            "key_agreement_protocols": ["curve25519-hkdf-sha256"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256.v2", "hkdf-hmac-sha256"],
            "short_authentication_string": ["decimal", "emoji"]
        }))
        .unwrap();

        let key_a =
            Curve25519PublicKey::from_base64("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg")
                .unwrap();

        let commitment = calculate_commitment(key_a, &content);
        assert_eq!(commitment, calculate_commitment(key_a, &content));

        let key_b = Curve25519PublicKey::from(&vodozemac::Curve25519SecretKey::new());
        assert_ne!(commitment, calculate_commitment(key_b, &content));
    }
}
