use crate::types::{ChannelId, ChannelSelection, Frame};

/// Frame restricted to the operator's channels, in source order.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectedFrame {
    pub frame: Frame,
    pub channels: Vec<ChannelId>,
    /// Positions of `channels` in the source frame.
    pub indices: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Selected(SelectedFrame),
    /// None of the selected channels is present in this frame.
    Empty,
}

/// Keeps the channels of `frame` that appear in `selection`. Order follows the
/// frame, not the selection.
pub fn select_channels(frame: Frame, selection: &ChannelSelection) -> Selection {
    let indices: Vec<usize> = frame
        .channels
        .iter()
        .enumerate()
        .filter(|(_, id)| selection.contains(**id))
        .map(|(idx, _)| idx)
        .collect();
    if indices.is_empty() {
        return Selection::Empty;
    }
    let channels: Vec<ChannelId> = indices.iter().map(|&i| frame.channels[i]).collect();
    let Frame {
        sample_rate_hz,
        samples,
        conversions,
        sequence,
        error,
        ..
    } = frame;
    let mut samples: Vec<Option<Vec<f64>>> = samples.into_iter().map(Some).collect();
    let reduced = Frame {
        sample_rate_hz,
        channels: channels.clone(),
        samples: indices
            .iter()
            .map(|&i| samples.get_mut(i).and_then(Option::take).unwrap_or_default())
            .collect(),
        conversions: indices
            .iter()
            .map(|&i| conversions.get(i).copied().unwrap_or_default())
            .collect(),
        sequence,
        error,
    };
    Selection::Selected(SelectedFrame {
        frame: reduced,
        channels,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(
            100.0,
            vec![5, 2, 9, 4],
            vec![vec![5.0; 3], vec![2.0; 3], vec![9.0; 3], vec![4.0; 3]],
        )
    }

    #[test]
    fn keeps_original_relative_order() {
        let sel = ChannelSelection::new([4, 5, 9]);
        let Selection::Selected(out) = select_channels(frame(), &sel) else {
            panic!("expected channels");
        };
        assert_eq!(out.channels, vec![5, 9, 4]);
        assert_eq!(out.indices, vec![0, 2, 3]);
        assert_eq!(out.frame.samples, vec![vec![5.0; 3], vec![9.0; 3], vec![4.0; 3]]);
        assert!(out.frame.is_consistent());
    }

    #[test]
    fn every_subset_matches_source_samples() {
        let source = frame();
        for mask in 1u32..16 {
            let ids: Vec<ChannelId> = source
                .channels
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, id)| *id)
                .collect();
            let Selection::Selected(out) = select_channels(source.clone(), &ChannelSelection::new(ids.clone())) else {
                panic!("mask {mask} selected nothing");
            };
            assert_eq!(out.channels, ids);
            for (k, &idx) in out.indices.iter().enumerate() {
                assert_eq!(out.frame.samples[k], source.samples[idx]);
            }
        }
    }

    #[test]
    fn missing_traces_do_not_panic() {
        let short = Frame::new(100.0, vec![0, 1], vec![vec![1.0; 3]]);
        let Selection::Selected(out) = select_channels(short, &ChannelSelection::new([1])) else {
            panic!("expected channels");
        };
        assert_eq!(out.frame.samples, vec![Vec::<f64>::new()]);
    }

    #[test]
    fn disjoint_selection_is_empty() {
        let sel = ChannelSelection::new([0, 1]);
        assert_eq!(select_channels(frame(), &sel), Selection::Empty);
    }
}
