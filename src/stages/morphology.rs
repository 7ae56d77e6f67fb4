//! Mask post-processing.
//!
//! Raw segmenter output goes through, in this order:
//!
//! 1. removal of objects touching the frame border
//! 2. hole filling
//! 3. morphological closing with a disk of `closing_disk` pixels
//! 4. relabelling of connected regions
//!
//! Hole filling must run before closing. Closing first seals narrow openings
//! of concave objects, and the subsequent fill then turns the enclosed
//! background into object pixels.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array2;
use std::collections::VecDeque;

/// Post-processing switches, resolved from the segmenter's mask kwargs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskOptions {
    pub clear_border: bool,
    pub fill_holes: bool,
    /// Closing radius in pixels, 0 disables closing
    pub closing_disk: u8,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            clear_border: true,
            fill_holes: true,
            closing_disk: 2,
        }
    }
}

/// Run the full post-processing chain on a binary mask and return labels.
pub fn postprocess(binary: &Array2<bool>, options: &MaskOptions) -> Array2<u16> {
    let mut mask = binary.clone();
    if options.clear_border {
        mask = clear_border(&mask);
    }
    if options.fill_holes {
        mask = fill_holes(&mask);
    }
    if options.closing_disk > 0 {
        mask = closing(&mask, options.closing_disk);
    }
    label(&mask)
}

/// Remove every 8-connected object that has a pixel on the frame border.
pub fn clear_border(mask: &Array2<bool>) -> Array2<bool> {
    let labels = label(mask);
    let (h, w) = labels.dim();
    let mut touching = std::collections::HashSet::new();
    for y in 0..h {
        for x in 0..w {
            if (y == 0 || x == 0 || y + 1 == h || x + 1 == w) && labels[[y, x]] != 0 {
                touching.insert(labels[[y, x]]);
            }
        }
    }
    labels.mapv(|l| l != 0 && !touching.contains(&l))
}

/// Set background regions that are not 4-connected to the frame border.
pub fn fill_holes(mask: &Array2<bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    let mut outside = Array2::from_elem((h, w), false);
    let mut queue = VecDeque::new();

    for y in 0..h {
        for x in 0..w {
            if (y == 0 || x == 0 || y + 1 == h || x + 1 == w) && !mask[[y, x]] {
                outside[[y, x]] = true;
                queue.push_back((y, x));
            }
        }
    }

    while let Some((y, x)) = queue.pop_front() {
        let neighbours = [
            (y.wrapping_sub(1), x),
            (y + 1, x),
            (y, x.wrapping_sub(1)),
            (y, x + 1),
        ];
        for (ny, nx) in neighbours {
            if ny < h && nx < w && !mask[[ny, nx]] && !outside[[ny, nx]] {
                outside[[ny, nx]] = true;
                queue.push_back((ny, nx));
            }
        }
    }

    outside.mapv(|o| !o)
}

/// Morphological closing (dilation followed by erosion) with the disk
/// `dy² + dx² <= radius²`. Pixels outside the frame take no part.
pub fn closing(mask: &Array2<bool>, radius: u8) -> Array2<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let footprint = disk(radius);
    let dilated = apply_footprint(mask, &footprint, true);
    apply_footprint(&dilated, &footprint, false)
}

fn disk(radius: u8) -> Vec<(isize, isize)> {
    let r = radius as isize;
    (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
        .filter(|(dy, dx)| dy * dy + dx * dx <= r * r)
        .collect()
}

/// Dilation when `any`, erosion otherwise.
fn apply_footprint(mask: &Array2<bool>, footprint: &[(isize, isize)], any: bool) -> Array2<bool> {
    let (h, w) = mask.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut covered = footprint.iter().filter_map(|&(dy, dx)| {
            let (ny, nx) = (y as isize + dy, x as isize + dx);
            let inside = ny >= 0 && nx >= 0 && (ny as usize) < h && (nx as usize) < w;
            inside.then(|| mask[[ny as usize, nx as usize]])
        });
        if any {
            covered.any(|v| v)
        } else {
            covered.all(|v| v)
        }
    })
}

/// Label 8-connected foreground regions 1..=n in raster order.
pub fn label(mask: &Array2<bool>) -> Array2<u16> {
    let (h, w) = mask.dim();
    if h == 0 || w == 0 {
        return Array2::zeros((h, w));
    }
    let components = connected_components(&to_gray(mask), Connectivity::Eight, Luma([0u8]));
    Array2::from_shape_fn((h, w), |(y, x)| {
        let id = components.get_pixel(x as u32, y as u32)[0];
        // Objects beyond the label range are dropped
        u16::try_from(id).unwrap_or(0)
    })
}

/// Number of distinct labels in a label image.
pub fn count_labels(labels: &Array2<u16>) -> usize {
    labels.iter().copied().max().unwrap_or(0) as usize
}

fn to_gray(mask: &Array2<bool>) -> GrayImage {
    let (h, w) = mask.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([if mask[[y as usize, x as usize]] { 255 } else { 0 }])
    })
}

fn from_gray(image: &GrayImage, (h, w): (usize, usize)) -> Array2<bool> {
    Array2::from_shape_fn((h, w), |(y, x)| image.get_pixel(x as u32, y as u32)[0] != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw_rect(mask: &mut Array2<bool>, y0: usize, y1: usize, x0: usize, x1: usize, value: bool) {
        for y in y0..y1 {
            for x in x0..x1 {
                mask[[y, x]] = value;
            }
        }
    }

    #[test]
    fn test_hole_and_border_noise() {
        // Solid square with an interior hole, plus noise touching the border
        let mut mask = Array2::from_elem((24, 24), false);
        draw_rect(&mut mask, 6, 18, 6, 18, true);
        draw_rect(&mut mask, 10, 13, 10, 13, false);
        mask[[0, 5]] = true;
        mask[[23, 0]] = true;
        mask[[12, 23]] = true;

        let labels = postprocess(&mask, &MaskOptions::default());

        assert_eq!(count_labels(&labels), 1);
        assert_eq!(labels[[11, 11]], 1, "hole must be filled");
        assert_eq!(labels[[0, 5]], 0);
        assert_eq!(labels[[23, 0]], 0);
        assert_eq!(labels[[12, 23]], 0);
        let area = labels.iter().filter(|&&l| l == 1).count();
        assert_eq!(area, 12 * 12);
    }

    #[test]
    fn test_fill_then_close_order() {
        // Thick ring with a one pixel slit through the top edge. Filling first
        // sees the cavity as open, closing afterwards seals the slit.
        let mut mask = Array2::from_elem((24, 24), false);
        draw_rect(&mut mask, 4, 20, 4, 20, true);
        draw_rect(&mut mask, 7, 17, 7, 17, false);
        draw_rect(&mut mask, 4, 7, 12, 13, false);

        let options = MaskOptions {
            clear_border: true,
            fill_holes: true,
            closing_disk: 1,
        };
        let labels = postprocess(&mask, &options);
        let expected = label(&closing(&fill_holes(&mask), 1));
        assert_eq!(labels, expected);

        let reversed = label(&fill_holes(&closing(&mask, 1)));
        assert_ne!(labels, reversed);
        assert_eq!(labels[[12, 12]], 0, "cavity stays background");
        assert_ne!(reversed[[12, 12]], 0);
    }

    #[test]
    fn test_closing_footprint_is_a_disk() {
        assert_eq!(disk(2).len(), 13);
        assert_eq!(disk(3).len(), 29);
        assert!(disk(3).contains(&(2, 2)));
        assert!(!disk(3).contains(&(1, 3)));

        // A background hole shaped like the footprint fits it exactly and
        // survives closing, corners included
        let mut mask = Array2::from_elem((24, 24), true);
        for (dy, dx) in disk(3) {
            mask[[(12 + dy) as usize, (12 + dx) as usize]] = false;
        }
        let closed = closing(&mask, 3);
        assert_eq!(closed, mask);
        assert!(!closed[[14, 14]]);

        // One pixel larger in every direction is no longer closed away
        let small = closing(&mask, 4);
        assert!(small.iter().all(|&v| v));
    }

    #[test]
    fn test_disabled_steps_keep_raw_shape() {
        let mut mask = Array2::from_elem((10, 10), false);
        draw_rect(&mut mask, 0, 3, 0, 3, true);
        draw_rect(&mut mask, 5, 9, 5, 9, true);
        mask[[7, 7]] = false;
        let options = MaskOptions {
            clear_border: false,
            fill_holes: false,
            closing_disk: 0,
        };
        let labels = postprocess(&mask, &options);
        assert_eq!(count_labels(&labels), 2);
        assert_eq!(labels[[7, 7]], 0);
    }

    #[test]
    fn test_empty_mask() {
        let labels = postprocess(&Array2::from_elem((8, 8), false), &MaskOptions::default());
        assert_eq!(count_labels(&labels), 0);
    }
}
