//! Deterministic user → cursor color assignment.
//!
//! `color_for` sums the code points of the user id and reduces the sum
//! modulo the palette length. The same id always maps to the same color,
//! in every process. Distinct users may share a color; that is cosmetic.

use serde::{Deserialize, Serialize};

/// RGBA color for cursor/badge rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl CursorColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// `#rrggbb` notation for the web view.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Normalized `[r, g, b, a]` for GPU upload.
    pub fn to_array(&self) -> [f32; 4] {
        [
            f32::from(self.r) / 255.0,
            f32::from(self.g) / 255.0,
            f32::from(self.b) / 255.0,
            f32::from(self.a) / 255.0,
        ]
    }
}

/// Fixed cursor palette.
pub const PALETTE: [CursorColor; 10] = [
    CursorColor::rgb(0xe5, 0x39, 0x35), // red
    CursorColor::rgb(0x1e, 0x88, 0xe5), // blue
    CursorColor::rgb(0x43, 0xa0, 0x47), // green
    CursorColor::rgb(0xfb, 0x8c, 0x00), // orange
    CursorColor::rgb(0x8e, 0x24, 0xaa), // purple
    CursorColor::rgb(0x00, 0xac, 0xc1), // cyan
    CursorColor::rgb(0xd8, 0x1b, 0x60), // pink
    CursorColor::rgb(0x6d, 0x4c, 0x41), // brown
    CursorColor::rgb(0x39, 0x49, 0xab), // indigo
    CursorColor::rgb(0x7c, 0xb3, 0x42), // lime
];

/// Palette slot for `user_id`.
pub fn palette_index(user_id: &str) -> usize {
    let sum = user_id
        .chars()
        .fold(0u64, |acc, c| acc.wrapping_add(u64::from(u32::from(c))));
    (sum % PALETTE.len() as u64) as usize
}

/// The display color for `user_id`.
pub fn color_for(user_id: &str) -> CursorColor {
    PALETTE[palette_index(user_id)]
}
