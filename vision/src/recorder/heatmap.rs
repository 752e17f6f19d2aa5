use frame_settle_common::{Frame, PixelFormat};

use crate::settle::raster::CircleMask;

/// "Hot" color map: black, red, yellow, white.
fn hot(v: u8) -> [f64; 3] {
    let t = v as f64 / 255.0;
    [
        (3.0 * t).clamp(0.0, 1.0) * 255.0,
        (3.0 * t - 1.0).clamp(0.0, 1.0) * 255.0,
        (3.0 * t - 2.0).clamp(0.0, 1.0) * 255.0,
    ]
}

fn luma(px: &[u8]) -> f64 {
    match px {
        [r, g, b] => 0.299 * *r as f64 + 0.587 * *g as f64 + 0.114 * *b as f64,
        [v, ..] => *v as f64,
        [] => 0.0,
    }
}

/// Blend the movement between two recorded settle frames over `current`.
///
/// The absolute difference is normalized so its maximum inside the mask is
/// full scale, colored with [`hot`] and alpha-blended with the squared
/// normalized difference as alpha. Without a predecessor only the masked
/// frame is returned.
pub fn heat_map(previous: Option<&Frame>, current: &Frame, mask_diameter: u32) -> Frame {
    let (w, h) = (current.width(), current.height());
    let c = current.channels();
    let mask = (mask_diameter > 0).then(|| CircleMask::new(w, h, mask_diameter));
    let inside = |i: usize| mask.as_ref().map_or(true, |m| m.contains(i));

    let previous = previous.filter(|p| {
        p.width() == w && p.height() == h && p.format() == current.format()
    });
    let Some(previous) = previous else {
        let data = current
            .data()
            .chunks_exact(c)
            .enumerate()
            .flat_map(|(i, px)| px.iter().map(move |&v| if inside(i) { v } else { 0 }))
            .collect();
        return Frame::new(w, h, current.format(), data, current.captured_at_ms(), current.seq())
            .unwrap_or_else(|_| current.clone());
    };

    let diff: Vec<f64> = current
        .data()
        .chunks_exact(c)
        .zip(previous.data().chunks_exact(c))
        .map(|(a, b)| {
            let d: Vec<u8> = a.iter().zip(b).map(|(x, y)| x.abs_diff(*y)).collect();
            luma(&d)
        })
        .collect();
    let max = diff
        .iter()
        .enumerate()
        .filter(|(i, _)| inside(*i))
        .map(|(_, d)| *d)
        .fold(0.0f64, f64::max);

    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for (i, px) in current.data().chunks_exact(c).enumerate() {
        if !inside(i) {
            data.extend_from_slice(&[0, 0, 0]);
            continue;
        }
        let n = if max > 0.0 {
            (diff[i] * 255.0 / max).round().min(255.0) as u8
        } else {
            0
        };
        let alpha = (n as f64 * n as f64) / (255.0 * 255.0);
        let heat = hot(n);
        for ch in 0..3 {
            let background = if c == 1 { px[0] } else { px[ch] } as f64;
            let value = (heat[ch] * alpha).round() + (background * (1.0 - alpha)).round();
            data.push(value.min(255.0) as u8);
        }
    }
    Frame::new(w, h, PixelFormat::Rgb8, data, current.captured_at_ms(), current.seq())
        .unwrap_or_else(|_| current.clone())
}
