//! Display geometry: where the decoded picture lands on the output, and which
//! output resolution suits a source.

use serde::{Deserialize, Serialize};

/// Rectangle in floating point pixel coordinates, `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl RectF {
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

/// Integer destination rectangle on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Pixels cut from each edge of the decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewMode {
    #[default]
    Normal,
    /// Fill the screen, cropping instead of showing bars.
    Zoom,
    Stretch4x3,
    Stretch14x9,
    Stretch16x9,
    /// One source line per display line.
    Original,
    Custom,
}

pub const PAL_PIXEL_RATIO: f32 = 128.0 / 117.0;
pub const NTSC_PIXEL_RATIO: f32 = 4320.0 / 4739.0;

/// Output resolutions a TV-style display may be driven at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Hdtv1080i,
    Hdtv720p,
    Hdtv480p4x3,
    Hdtv480p16x9,
    Ntsc4x3,
    Ntsc16x9,
    Pal4x3,
    Pal16x9,
    Pal60_4x3,
    Pal60_16x9,
    Desktop { width: u32, height: u32 },
}

impl Resolution {
    pub fn size(self) -> (u32, u32) {
        match self {
            Self::Hdtv1080i => (1920, 1080),
            Self::Hdtv720p => (1280, 720),
            Self::Hdtv480p4x3
            | Self::Hdtv480p16x9
            | Self::Ntsc4x3
            | Self::Ntsc16x9
            | Self::Pal60_4x3
            | Self::Pal60_16x9 => (720, 480),
            Self::Pal4x3 | Self::Pal16x9 => (720, 576),
            Self::Desktop { width, height } => (width, height),
        }
    }

    /// Width of a display pixel relative to its height.
    pub fn pixel_ratio(self) -> f32 {
        match self {
            Self::Hdtv1080i | Self::Hdtv720p | Self::Desktop { .. } => 1.0,
            Self::Hdtv480p4x3 | Self::Ntsc4x3 | Self::Pal60_4x3 => NTSC_PIXEL_RATIO,
            Self::Hdtv480p16x9 | Self::Ntsc16x9 | Self::Pal60_16x9 => NTSC_PIXEL_RATIO * 4.0 / 3.0,
            Self::Pal4x3 => PAL_PIXEL_RATIO,
            Self::Pal16x9 => PAL_PIXEL_RATIO * 4.0 / 3.0,
        }
    }

    pub fn is_interlaced(self) -> bool {
        matches!(
            self,
            Self::Hdtv1080i
                | Self::Ntsc4x3
                | Self::Ntsc16x9
                | Self::Pal4x3
                | Self::Pal16x9
                | Self::Pal60_4x3
                | Self::Pal60_16x9
        )
    }

    /// 4:3 TV modes, where stretching fills the screen limits instead.
    pub fn is_tv_4x3(self) -> bool {
        matches!(
            self,
            Self::Pal4x3 | Self::Pal60_4x3 | Self::Ntsc4x3 | Self::Hdtv480p4x3
        )
    }

    pub fn class(self) -> ResolutionClass {
        let (_, height) = self.size();
        let kind = match height {
            0..=480 => ResolutionKind::Sd480,
            481..=576 => ResolutionKind::Sd576,
            577..=720 => ResolutionKind::Hd720,
            _ => ResolutionKind::Hd1080,
        };
        ResolutionClass {
            kind,
            interlaced: self.is_interlaced(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    Sd480,
    Sd576,
    Hd720,
    Hd1080,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionClass {
    pub kind: ResolutionKind,
    pub interlaced: bool,
}

impl ResolutionClass {
    pub fn is_sd(&self) -> bool {
        matches!(self.kind, ResolutionKind::Sd480 | ResolutionKind::Sd576)
    }
}

/// What the attached display can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayCaps {
    /// The display runs a PAL video standard.
    pub pal: bool,
    pub pal60: bool,
    pub pal60_switching: bool,
    /// With switching on, whether 16:9 is available; otherwise whether the
    /// current mode is already widescreen.
    pub widescreen: bool,
    pub widescreen_switching: bool,
    pub hd_480p: bool,
    pub hd_720p: bool,
    pub hd_1080i: bool,
}

impl Default for DisplayCaps {
    fn default() -> Self {
        Self {
            pal: false,
            pal60: false,
            pal60_switching: false,
            widescreen: true,
            widescreen_switching: true,
            hd_480p: true,
            hd_720p: true,
            hd_1080i: true,
        }
    }
}

/// Frame aspect ratio of the source, correcting for the non-square pixels of
/// VCD, SVCD and DVD frame sizes when the decoder asks for a different display
/// size.
pub fn source_frame_ratio(width: u32, height: u32, desired_width: u32, desired_height: u32) -> f32 {
    let desired = desired_width as f32 / desired_height.max(1) as f32;
    if width == desired_width && height == desired_height {
        return desired;
    }
    let image = width as f32 / height.max(1) as f32;
    let non_4x3 = desired / (4.0 / 3.0);
    match (width, height) {
        (352, 240) => image * NTSC_PIXEL_RATIO,
        (352, 288) => image * PAL_PIXEL_RATIO,
        (480, 480) => image * 3.0 / 2.0 * NTSC_PIXEL_RATIO * non_4x3,
        (480, 576) => image * 3.0 / 2.0 * PAL_PIXEL_RATIO * non_4x3,
        (720, 480) => image * NTSC_PIXEL_RATIO * non_4x3,
        (720, 576) => image * PAL_PIXEL_RATIO * non_4x3,
        _ => desired,
    }
}

/// Aspect ratio of the cropped picture.
pub fn cropped_aspect_ratio(source_ratio: f32, width: u32, height: u32, crop: &CropRect) -> f32 {
    let w = width.saturating_sub(crop.left + crop.right) as f32;
    let h = height.saturating_sub(crop.top + crop.bottom).max(1) as f32;
    source_ratio * w / h * height as f32 / width.max(1) as f32
}

/// Zoom and pixel ratio derived from a view mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewScale {
    pub zoom: f32,
    pub pixel_ratio: f32,
}

impl Default for ViewScale {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pixel_ratio: 1.0,
        }
    }
}

pub struct ViewInputs {
    pub mode: ViewMode,
    pub custom: ViewScale,
    pub resolution: Resolution,
    pub screen: RectF,
    /// Ratio of the cropped source picture.
    pub aspect: f32,
    pub cropped_height: f32,
}

pub fn view_scale(inputs: &ViewInputs) -> ViewScale {
    let screen_w = inputs.screen.width();
    let screen_h = inputs.screen.height();
    let res_ratio = inputs.resolution.pixel_ratio();
    let source = inputs.aspect;
    match inputs.mode {
        ViewMode::Normal => ViewScale::default(),
        ViewMode::Custom => inputs.custom,
        ViewMode::Zoom => {
            let output = source / res_ratio;
            let mut new_w = screen_h * output;
            let mut zoom = new_w / screen_w;
            if new_w < screen_w {
                new_w = screen_w;
                zoom = (new_w / output) / screen_h;
            }
            ViewScale {
                zoom,
                pixel_ratio: 1.0,
            }
        }
        ViewMode::Stretch4x3 => ViewScale {
            zoom: 1.0,
            pixel_ratio: if inputs.resolution.is_tv_4x3() {
                (screen_w / screen_h) * res_ratio / source
            } else {
                (4.0 / 3.0) / source
            },
        },
        ViewMode::Stretch14x9 => ViewScale {
            zoom: 1.0,
            pixel_ratio: (14.0 / 9.0) / source,
        },
        ViewMode::Stretch16x9 => ViewScale {
            zoom: 1.0,
            pixel_ratio: if inputs.resolution.is_tv_4x3() {
                (16.0 / 9.0) / source
            } else {
                (screen_w / screen_h) * res_ratio / source
            },
        },
        ViewMode::Original => {
            let output = source / res_ratio;
            let mut new_h = screen_w / output;
            if new_h > screen_h {
                new_h = screen_h;
            }
            ViewScale {
                zoom: inputs.cropped_height / new_h,
                pixel_ratio: 1.0,
            }
        }
    }
}

/// Source crop and destination placement of the picture.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DisplayGeometry {
    pub src: RectF,
    pub dst: Rect,
}

/// Lays the picture out in `viewport`: widest fit keeping aspect, scaled by
/// `zoom`, centred. Field-synchronised output keeps the top and bottom edges on
/// even lines so field parity is preserved.
#[allow(clippy::too_many_arguments)]
pub fn display_geometry(
    viewport: RectF,
    width: u32,
    height: u32,
    crop: &CropRect,
    input_ratio: f32,
    zoom: f32,
    display_pixel_ratio: f32,
    fielded: bool,
) -> DisplayGeometry {
    let src = RectF::new(
        crop.left as f32,
        crop.top as f32,
        width.saturating_sub(crop.right) as f32,
        height.saturating_sub(crop.bottom) as f32,
    );

    let screen_w = viewport.width();
    let screen_h = viewport.height();
    let output = input_ratio / display_pixel_ratio;
    let mut new_w = screen_w;
    let mut new_h = new_w / output;
    if new_h > screen_h {
        new_h = screen_h;
        new_w = new_h * output;
    }
    new_w *= zoom;
    new_h *= zoom;

    let pos_x = (screen_w - new_w) / 2.0;
    let pos_y = (screen_h - new_h) / 2.0;
    let left = (pos_x + viewport.x0) as i32;
    let right = (left as f32 + new_w + 0.5) as i32;
    let mut top = (pos_y + viewport.y0) as i32;
    let mut bottom = (top as f32 + new_h + 0.5) as i32;
    if fielded {
        top &= !1;
        bottom &= !1;
    }

    DisplayGeometry {
        src,
        dst: Rect {
            x: left,
            y: top,
            width: (right - left).max(0) as u32,
            height: (bottom - top).max(0) as u32,
        },
    }
}

/// Picks the output resolution for a source running at `fps`.
pub fn choose_best_resolution(
    fps: f64,
    source_ratio: f32,
    width: u32,
    height: u32,
    caps: &DisplayCaps,
) -> Resolution {
    let pal60 = caps.pal
        && caps.pal60
        && caps.pal60_switching
        && fps > 0.0
        && {
            // Distance from a divisor of 120 and 100, to allow for 2:3 pulldown.
            let diff60 = (120.0 / fps - (120.0 / fps).round()).abs();
            let diff50 = (100.0 / fps - (100.0 / fps).round()).abs();
            diff60 < diff50
        };

    // 8 / (3 * sqrt 3) equalises the black bar area of 4:3 and 16:9.
    let widescreen = if caps.widescreen_switching {
        caps.widescreen && source_ratio > 8.0 / (3.0 * 3.0f32.sqrt())
    } else {
        caps.widescreen
    };

    if caps.pal {
        return match (pal60, widescreen) {
            (true, true) => Resolution::Pal60_16x9,
            (true, false) => Resolution::Pal60_4x3,
            (false, true) => Resolution::Pal16x9,
            (false, false) => Resolution::Pal4x3,
        };
    }

    let beyond_720 = height > 720 || width > 1280;
    let beyond_sd = height > 480 || width > 720;
    if beyond_720 && caps.hd_1080i {
        Resolution::Hdtv1080i
    } else if beyond_sd && caps.hd_720p {
        Resolution::Hdtv720p
    } else if beyond_sd && caps.hd_1080i {
        Resolution::Hdtv1080i
    } else if caps.hd_480p {
        if widescreen {
            Resolution::Hdtv480p16x9
        } else {
            Resolution::Hdtv480p4x3
        }
    } else if widescreen {
        Resolution::Ntsc16x9
    } else {
        Resolution::Ntsc4x3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn normal_rect_pillarboxes_4x3_on_16x9() {
        let g = display_geometry(
            RectF::new(0.0, 0.0, 1280.0, 720.0),
            720,
            480,
            &CropRect::default(),
            4.0 / 3.0,
            1.0,
            1.0,
            false,
        );
        assert_eq!(g.dst, Rect { x: 160, y: 0, width: 960, height: 720 });
        assert_eq!(g.src, RectF::new(0.0, 0.0, 720.0, 480.0));
    }

    #[test]
    fn fielded_rect_starts_on_even_line() {
        let g = display_geometry(
            RectF::new(0.0, 0.0, 720.0, 576.0),
            720,
            576,
            &CropRect::default(),
            16.0 / 9.0,
            1.0,
            1.0,
            true,
        );
        assert_eq!(g.dst.y % 2, 0);
        assert_eq!((g.dst.y + g.dst.height as i32) % 2, 0);
    }

    #[test]
    fn crop_shrinks_source_rect() {
        let crop = CropRect {
            left: 8,
            top: 4,
            right: 8,
            bottom: 4,
        };
        let g = display_geometry(
            RectF::new(0.0, 0.0, 720.0, 480.0),
            720,
            480,
            &crop,
            1.5,
            1.0,
            1.0,
            false,
        );
        assert_eq!(g.src, RectF::new(8.0, 4.0, 712.0, 476.0));
    }

    #[test]
    fn dvd_frames_use_tv_pixel_ratios() {
        let ntsc = source_frame_ratio(720, 480, 640, 480);
        assert!(approx(ntsc, 1.5 * NTSC_PIXEL_RATIO));
        let pal_wide = source_frame_ratio(720, 576, 1024, 576);
        assert!(approx(pal_wide, 1.25 * PAL_PIXEL_RATIO * (16.0 / 9.0) / (4.0 / 3.0)));
        assert!(approx(source_frame_ratio(640, 480, 640, 480), 4.0 / 3.0));
    }

    #[test]
    fn pal60_follows_frame_rate() {
        let caps = DisplayCaps {
            pal: true,
            pal60: true,
            pal60_switching: true,
            ..Default::default()
        };
        assert_eq!(choose_best_resolution(25.0, 4.0 / 3.0, 720, 576, &caps), Resolution::Pal4x3);
        assert_eq!(
            choose_best_resolution(29.97, 16.0 / 9.0, 720, 480, &caps),
            Resolution::Pal60_16x9
        );
    }

    #[test]
    fn hd_sources_pick_hd_modes() {
        let caps = DisplayCaps::default();
        assert_eq!(choose_best_resolution(25.0, 16.0 / 9.0, 1920, 1080, &caps), Resolution::Hdtv1080i);
        assert_eq!(choose_best_resolution(25.0, 16.0 / 9.0, 1280, 720, &caps), Resolution::Hdtv720p);
        assert_eq!(choose_best_resolution(25.0, 4.0 / 3.0, 720, 480, &caps), Resolution::Hdtv480p4x3);
        assert!(Resolution::Hdtv1080i.class().interlaced);
        assert!(Resolution::Pal4x3.class().is_sd());
    }

    #[test]
    fn stretch_and_zoom_modes() {
        let inputs = ViewInputs {
            mode: ViewMode::Stretch16x9,
            custom: ViewScale::default(),
            resolution: Resolution::Hdtv720p,
            screen: RectF::new(0.0, 0.0, 1280.0, 720.0),
            aspect: 4.0 / 3.0,
            cropped_height: 480.0,
        };
        let s = view_scale(&inputs);
        assert!(approx(s.pixel_ratio, (16.0 / 9.0) / (4.0 / 3.0)));

        let zoom = view_scale(&ViewInputs {
            mode: ViewMode::Zoom,
            ..inputs
        });
        assert!(approx(zoom.zoom, 4.0 / 3.0));
    }
}
