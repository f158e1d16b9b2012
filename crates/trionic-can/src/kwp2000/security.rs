//! Trionic 7 seed/key derivation

/// `(xor, sub)` pairs, tried in order until the ECU accepts one
pub const KEY_METHODS: [(u16, u16); 5] = [
    (0x8142, 0x2356),
    (0x4081, 0x1F6F),
    (0x03DC, 0x2356),
    (0x03D7, 0x2356),
    (0x0409, 0x2356),
];

/// Key for `seed` using method `method` (index into [`KEY_METHODS`])
pub fn calc_key(seed: u16, method: usize) -> Option<u16> {
    let (xor, sub) = KEY_METHODS.get(method)?;
    Some(((seed << 2) ^ xor).wrapping_sub(*sub))
}

/// ECU side of the exchange: does `key` unlock `seed` under `method`?
pub fn verify_key(seed: u16, key: u16, method: usize) -> bool {
    calc_key(seed, method) == Some(key)
}
