//! Pointer tracking for mouse, touch and remote controllers.

use std::collections::BTreeMap;
use std::fmt;

/// Identity of a pointer. Ids are reused; a pointer is never removed while
/// its source is alive.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointerSource {
    Local,
    Touch(u64),
    Remote { session: u64, id: String },
}

impl PointerSource {
    pub fn remote(session: u64, id: impl Into<String>) -> Self {
        PointerSource::Remote {
            session,
            id: id.into(),
        }
    }

    pub fn session(&self) -> Option<u64> {
        match self {
            PointerSource::Remote { session, .. } => Some(*session),
            _ => None,
        }
    }
}

impl fmt::Display for PointerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerSource::Local => f.write_str("local"),
            PointerSource::Touch(id) => write!(f, "touch:{id}"),
            PointerSource::Remote { session, id } => write!(f, "remote:{session}/{id}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pointer {
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: [f32; 3],
    pub colorful: bool,
}

impl Pointer {
    fn new(colorful: bool) -> Self {
        Self {
            texcoord: [0.0; 2],
            prev_texcoord: [0.0; 2],
            delta: [0.0; 2],
            down: false,
            moved: false,
            color: [0.0; 3],
            colorful,
        }
    }
}

/// Delta in texture space, compensated so equal screen distances produce
/// equal splat strength on both axes.
pub fn corrected_delta(delta: [f32; 2], aspect: f32) -> [f32; 2] {
    let [mut dx, mut dy] = delta;
    if aspect < 1.0 {
        dx *= aspect;
    }
    if aspect > 1.0 {
        dy /= aspect;
    }
    [dx, dy]
}

#[derive(Debug, Default)]
pub struct Pointers {
    pointers: BTreeMap<PointerSource, Pointer>,
}

impl Pointers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the pointer on first use and places it at `texcoord` with no
    /// motion.
    pub fn down(
        &mut self,
        source: PointerSource,
        texcoord: [f32; 2],
        color: [f32; 3],
        colorful: bool,
    ) -> &Pointer {
        let pointer = self
            .pointers
            .entry(source)
            .or_insert_with(|| Pointer::new(colorful));
        pointer.down = true;
        pointer.moved = false;
        pointer.texcoord = texcoord;
        pointer.prev_texcoord = texcoord;
        pointer.delta = [0.0; 2];
        pointer.color = color;
        pointer.colorful = colorful;
        pointer
    }

    /// Ignored for unknown or released pointers.
    pub fn moved(&mut self, source: &PointerSource, texcoord: [f32; 2], aspect: f32) -> bool {
        let Some(pointer) = self.pointers.get_mut(source) else {
            return false;
        };
        if !pointer.down {
            return false;
        }
        pointer.prev_texcoord = pointer.texcoord;
        pointer.texcoord = texcoord;
        pointer.delta = corrected_delta(
            [
                texcoord[0] - pointer.prev_texcoord[0],
                texcoord[1] - pointer.prev_texcoord[1],
            ],
            aspect,
        );
        pointer.moved = pointer.delta[0].abs() > 0.0 || pointer.delta[1].abs() > 0.0;
        pointer.moved
    }

    pub fn up(&mut self, source: &PointerSource) {
        if let Some(pointer) = self.pointers.get_mut(source) {
            pointer.down = false;
        }
    }

    pub fn set_color(&mut self, source: &PointerSource, color: [f32; 3]) -> bool {
        self.pointers
            .get_mut(source)
            .map(|pointer| pointer.color = color)
            .is_some()
    }

    pub fn set_colorful(&mut self, source: &PointerSource, colorful: bool) -> bool {
        self.pointers
            .get_mut(source)
            .map(|pointer| pointer.colorful = colorful)
            .is_some()
    }

    /// Drops every pointer owned by a closed remote session.
    pub fn release_session(&mut self, session: u64) -> usize {
        let before = self.pointers.len();
        self.pointers
            .retain(|source, _| source.session() != Some(session));
        before - self.pointers.len()
    }

    pub fn get(&self, source: &PointerSource) -> Option<&Pointer> {
        self.pointers.get(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PointerSource, &Pointer)> {
        self.pointers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PointerSource, &mut Pointer)> {
        self.pointers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_move_up_scenario() {
        let mut pointers = Pointers::new();
        pointers.down(PointerSource::Local, [0.5, 0.5], [0.1, 0.0, 0.0], true);
        assert!(pointers.moved(&PointerSource::Local, [0.6, 0.5], 1.0));

        let pointer = pointers.get(&PointerSource::Local).unwrap();
        assert!(pointer.moved);
        assert!(pointer.delta[0] > 0.0);
        assert_eq!(pointer.delta[1], 0.0);

        pointers.up(&PointerSource::Local);
        let pointer = pointers.get(&PointerSource::Local).unwrap();
        assert!(!pointer.down);
        assert_eq!(pointer.texcoord, [0.6, 0.5]);
        assert_eq!(pointer.prev_texcoord, [0.5, 0.5]);
    }

    #[test]
    fn delta_is_aspect_corrected() {
        assert_eq!(corrected_delta([0.2, 0.2], 2.0), [0.2, 0.1]);
        assert_eq!(corrected_delta([0.2, 0.2], 0.5), [0.1, 0.2]);
        assert_eq!(corrected_delta([0.2, 0.2], 1.0), [0.2, 0.2]);
    }

    #[test]
    fn moves_without_down_are_ignored() {
        let mut pointers = Pointers::new();
        assert!(!pointers.moved(&PointerSource::Touch(3), [0.1, 0.1], 1.0));
        pointers.down(PointerSource::Touch(3), [0.1, 0.1], [0.0; 3], false);
        pointers.up(&PointerSource::Touch(3));
        assert!(!pointers.moved(&PointerSource::Touch(3), [0.2, 0.2], 1.0));
        assert_eq!(pointers.len(), 1);
    }

    #[test]
    fn ids_are_reused_across_presses() {
        let mut pointers = Pointers::new();
        pointers.down(PointerSource::Touch(1), [0.1, 0.1], [0.0; 3], true);
        pointers.up(&PointerSource::Touch(1));
        pointers.down(PointerSource::Touch(1), [0.7, 0.7], [0.0; 3], true);
        assert_eq!(pointers.len(), 1);
        let pointer = pointers.get(&PointerSource::Touch(1)).unwrap();
        assert!(pointer.down);
        assert_eq!(pointer.delta, [0.0, 0.0]);
    }

    #[test]
    fn session_release_only_touches_that_session() {
        let mut pointers = Pointers::new();
        pointers.down(PointerSource::remote(1, "a"), [0.1, 0.1], [0.0; 3], true);
        pointers.down(PointerSource::remote(1, "b"), [0.2, 0.1], [0.0; 3], true);
        pointers.down(PointerSource::remote(2, "a"), [0.3, 0.1], [0.0; 3], true);
        pointers.down(PointerSource::Touch(1), [0.4, 0.1], [0.0; 3], true);
        assert_eq!(pointers.release_session(1), 2);
        assert!(pointers.get(&PointerSource::remote(1, "a")).is_none());
        assert!(pointers.get(&PointerSource::remote(2, "a")).unwrap().down);
        assert!(pointers.get(&PointerSource::Touch(1)).is_some());
        assert_eq!(pointers.len(), 2);
    }

    #[test]
    fn reconnecting_sessions_do_not_accumulate_pointers() {
        let mut pointers = Pointers::new();
        for session in 0..1000 {
            pointers.down(PointerSource::remote(session, "pad"), [0.5, 0.5], [0.0; 3], true);
            pointers.release_session(session);
        }
        assert!(pointers.is_empty());
    }
}
