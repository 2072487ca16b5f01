use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn short_side(&self) -> f32 {
        self.width.min(self.height)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Shrink by `amount` on every side, never below zero size.
    pub fn inset(&self, amount: f32) -> Rect {
        Rect::new(
            self.x + amount,
            self.y + amount,
            (self.width - 2.0 * amount).max(0.0),
            (self.height - 2.0 * amount).max(0.0),
        )
    }

    /// Split off a strip of `height` at the top: (strip, rest).
    pub fn split_top(&self, height: f32) -> (Rect, Rect) {
        let height = height.min(self.height).max(0.0);
        (
            Rect::new(self.x, self.y, self.width, height),
            Rect::new(self.x, self.y + height, self.width, self.height - height),
        )
    }

    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }
}

/// Where item `index` (position in the input slice) was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub index: usize,
    pub rect: Rect,
}

/// Squarified treemap (Bruls, Huizing, van Wijk) over `weights`, which must be
/// sorted descending and strictly positive.
///
/// Rows grow while adding the next item does not worsen the row's worst
/// aspect ratio; each row is laid along the shorter side of the free space.
pub fn squarify(weights: &[f64], container: Rect) -> Vec<Placement> {
    let mut placements = Vec::with_capacity(weights.len());
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 || container.area() <= 0.0 {
        return placements;
    }

    let scale = container.area() as f64 / total;
    let sizes: Vec<f64> = weights.iter().map(|w| w * scale).collect();
    let mut free = container;
    let mut start = 0;

    while start < sizes.len() {
        let side = free.short_side() as f64;
        if side <= 0.0 {
            // Float leftovers: nothing visible remains for the tail.
            for index in start..sizes.len() {
                placements.push(Placement {
                    index,
                    rect: Rect::new(free.x, free.y, 0.0, 0.0),
                });
            }
            break;
        }

        let mut end = start + 1;
        let mut sum = sizes[start];
        let mut min = sizes[start];
        let max = sizes[start];
        let mut worst = worst_ratio(sum, min, max, side);
        while end < sizes.len() {
            let candidate = sizes[end];
            let next_sum = sum + candidate;
            let next_min = min.min(candidate);
            let next_worst = worst_ratio(next_sum, next_min, max, side);
            if next_worst > worst {
                break;
            }
            sum = next_sum;
            min = next_min;
            worst = next_worst;
            end += 1;
        }

        let last_row = end == sizes.len();
        free = layout_row(&sizes[start..end], start, sum, free, last_row, &mut placements);
        start = end;
    }

    placements
}

/// Worst aspect ratio of a row with the given area sum, extreme areas and
/// short side length.
fn worst_ratio(sum: f64, min: f64, max: f64, side: f64) -> f64 {
    let side2 = side * side;
    let sum2 = sum * sum;
    (side2 * max / sum2).max(sum2 / (side2 * min))
}

fn layout_row(
    sizes: &[f64],
    first_index: usize,
    sum: f64,
    free: Rect,
    last_row: bool,
    placements: &mut Vec<Placement>,
) -> Rect {
    let vertical = free.width >= free.height;
    let length = f64::from(if vertical { free.height } else { free.width });
    let available = if vertical { free.width } else { free.height };
    let mut breadth = (sum / length) as f32;
    if last_row || breadth > available {
        breadth = available;
    }

    let mut offset = 0.0f32;
    for (i, size) in sizes.iter().enumerate() {
        let mut extent = (size / sum * length) as f32;
        if i + 1 == sizes.len() {
            // Absorb rounding so the row ends exactly at the edge.
            extent = length as f32 - offset;
        }
        let rect = if vertical {
            Rect::new(free.x, free.y + offset, breadth, extent)
        } else {
            Rect::new(free.x + offset, free.y, extent, breadth)
        };
        placements.push(Placement {
            index: first_index + i,
            rect,
        });
        offset += extent;
    }

    if vertical {
        Rect::new(free.x + breadth, free.y, free.width - breadth, free.height)
    } else {
        Rect::new(free.x, free.y + breadth, free.width, free.height - breadth)
    }
}
