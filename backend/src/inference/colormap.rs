/// Entries in a colormap lookup table.
pub const COLORMAP_SIZE: usize = 256;

/// Leading entries whose alpha ramps from fully transparent to opaque.
const FADE_ENTRIES: usize = COLORMAP_SIZE / 2;

// Polynomial fit of matplotlib's viridis, one coefficient row per power of t.
const VIRIDIS: [[f64; 3]; 7] = [
    [0.277_727_327_223_417_7, 0.005_407_344_544_966_578, 0.334_099_805_335_306_1],
    [0.105_093_043_108_577_4, 1.404_613_529_898_575, 1.384_590_162_594_685],
    [-0.330_861_828_725_556_3, 0.214_847_559_468_213, 0.095_095_163_028_236_59],
    [-4.634_230_498_983_486, -5.799_100_973_351_585, -19.332_440_956_279_87],
    [6.228_269_936_347_081, 14.179_933_366_805_09, 56.690_556_627_382_43],
    [4.776_384_997_670_288, -13.745_145_377_746_01, -65.353_032_633_372_34],
    [-5.435_455_855_934_631, 4.645_852_612_178_535, 26.312_435_249_583_2],
];

fn viridis(t: f64) -> [f64; 3] {
    let mut rgb = [0.0; 3];
    for (channel, value) in rgb.iter_mut().enumerate() {
        *value = VIRIDIS
            .iter()
            .rev()
            .fold(0.0, |acc, coefficients| acc * t + coefficients[channel])
            .clamp(0.0, 1.0);
    }
    rgb
}

fn to_byte(v: f64) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// RGBA lookup table indexed by a value in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Colormap {
    table: Vec<[u8; 4]>,
}

impl Colormap {
    /// Viridis whose lower half fades in, so weak responses stay invisible.
    pub fn faded_viridis() -> Self {
        let table = (0..COLORMAP_SIZE)
            .map(|i| {
                let [r, g, b] = viridis(i as f64 / (COLORMAP_SIZE - 1) as f64);
                let alpha = if i < FADE_ENTRIES {
                    i as f64 / (FADE_ENTRIES - 1) as f64
                } else {
                    1.0
                };
                [to_byte(r), to_byte(g), to_byte(b), to_byte(alpha)]
            })
            .collect();
        Self { table }
    }

    pub fn entry(&self, index: usize) -> [u8; 4] {
        self.table[index.min(COLORMAP_SIZE - 1)]
    }

    /// Non-finite values map to a transparent pixel.
    pub fn lookup(&self, t: f32) -> [u8; 4] {
        if !t.is_finite() {
            return [0, 0, 0, 0];
        }
        let scaled = (t.clamp(0.0, 1.0) * COLORMAP_SIZE as f32) as usize;
        self.entry(scaled)
    }
}
