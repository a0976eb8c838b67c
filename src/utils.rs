use nalgebra::{DVector, SVector};
use num_traits::Float;

/// Face feature vector as produced by the upstream extractor.
pub type Embedding = DVector<f32>;

/// Compute IoU between two bounding boxes given as [x1, y1, x2, y2].
pub fn compute_iou(a: &SVector<f32, 4>, b: &SVector<f32, 4>) -> f32 {
    compute_iou_tlbr(a[0], a[1], a[2], a[3], b[0], b[1], b[2], b[3])
}

/// Helper function to compute IoU from top-left and bottom-right coordinates
#[allow(clippy::too_many_arguments)]
fn compute_iou_tlbr(a_x1: f32, a_y1: f32, a_x2: f32, a_y2: f32,
                   b_x1: f32, b_y1: f32, b_x2: f32, b_y2: f32) -> f32 {
    let x1 = a_x1.max(b_x1);
    let y1 = a_y1.max(b_y1);
    let x2 = a_x2.min(b_x2);
    let y2 = a_y2.min(b_y2);

    if x1 >= x2 || y1 >= y2 {
        return 0.0;
    }

    let inter_area = (x2 - x1) * (y2 - y1);
    let a_area = (a_x2 - a_x1) * (a_y2 - a_y1);
    let b_area = (b_x2 - b_x1) * (b_y2 - b_y1);

    let union = a_area + b_area - inter_area;
    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// Centre point of a [x1, y1, x2, y2] box.
pub fn bbox_center(tlbr: &SVector<f32, 4>) -> (f32, f32) {
    ((tlbr[0] + tlbr[2]) / 2.0, (tlbr[1] + tlbr[3]) / 2.0)
}

/// Cosine similarity in [-1, 1].
///
/// Returns 0.0 when either vector has zero norm or the lengths differ, so a
/// degenerate embedding never produces NaN.
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let denom = a.norm() * b.norm();
    if denom <= f32::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0)
}

/// Scale to unit length, or `None` for a zero or non-finite vector.
pub fn l2_normalize(v: &Embedding) -> Option<Embedding> {
    let norm = v.norm();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(v / norm)
}

/// Arithmetic mean of equally sized vectors, re-normalized to unit length.
pub fn mean_embedding(embeddings: &[Embedding]) -> Option<Embedding> {
    let first = embeddings.first()?;
    let mut sum = Embedding::zeros(first.len());
    for e in embeddings {
        if e.len() != sum.len() {
            return None;
        }
        sum += e;
    }
    l2_normalize(&(sum / embeddings.len() as f32))
}

pub fn mean<T: Float>(values: &[T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let sum = values.iter().fold(T::zero(), |acc, &v| acc + v);
    T::from(values.len()).map(|n| sum / n)
}

/// Population standard deviation.
pub fn population_std<T: Float>(values: &[T]) -> Option<T> {
    let m = mean(values)?;
    let var = values.iter().fold(T::zero(), |acc, &v| acc + (v - m) * (v - m));
    T::from(values.len()).map(|n| (var / n).sqrt())
}
