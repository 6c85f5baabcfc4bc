// 该文件是 Tuzhi （图志） 项目的一部分。
// src/hotkey.rs - 全局热键
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::mpsc::Sender;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  overlay::PresenterControl,
  task::{FlightToken, Shutdown, SingleFlight},
};

#[cfg(feature = "x11")]
mod x11_poller;
#[cfg(feature = "x11")]
pub use self::x11_poller::X11KeyPoller;

const KEYSYM_F1: u32 = 0xffbe;
const MAX_FUNCTION_KEY: u8 = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HotkeyError {
  #[error("无法识别的按键: {0:?}")]
  UnknownKey(String),
  #[error("按键 {0} 在当前键盘布局中不存在")]
  Unmapped(Key),
  #[error("按键 {0} 被重复绑定")]
  Duplicate(Key),
  #[error("X11 键盘查询失败: {0}")]
  Display(String),
}

/// 支持 F1-F24 和单个可打印 ASCII 字符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
  Function(u8),
  Char(char),
}

impl Key {
  /// X11 keysym
  pub fn keysym(&self) -> u32 {
    match self {
      Key::Function(n) => KEYSYM_F1 + (*n as u32) - 1,
      Key::Char(c) => *c as u32,
    }
  }
}

impl FromStr for Key {
  type Err = HotkeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let unknown = || HotkeyError::UnknownKey(s.to_string());

    let mut chars = s.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
      if c.is_ascii_graphic() {
        return Ok(Key::Char(c.to_ascii_lowercase()));
      }
      return Err(unknown());
    }

    let number = s
      .strip_prefix('F')
      .or_else(|| s.strip_prefix('f'))
      .ok_or_else(unknown)?;
    match number.parse::<u8>() {
      Ok(n) if (1..=MAX_FUNCTION_KEY).contains(&n) => Ok(Key::Function(n)),
      _ => Err(unknown()),
    }
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Function(n) => write!(f, "F{}", n),
      Key::Char(c) => write!(f, "{}", c),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
  Generate,
  ToggleVisibility,
  Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBindings {
  bindings: Vec<(Key, HotkeyEvent)>,
}

impl KeyBindings {
  /// 静态导出不需要切换键，传 None
  pub fn new(generate: Key, toggle: Option<Key>, quit: Key) -> Result<Self, HotkeyError> {
    let mut bindings = vec![(generate, HotkeyEvent::Generate)];
    if let Some(toggle) = toggle {
      bindings.push((toggle, HotkeyEvent::ToggleVisibility));
    }
    bindings.push((quit, HotkeyEvent::Quit));

    for (i, (key, _)) in bindings.iter().enumerate() {
      if bindings[..i].iter().any(|(k, _)| k == key) {
        return Err(HotkeyError::Duplicate(*key));
      }
    }
    Ok(Self { bindings })
  }

  pub fn iter(&self) -> impl Iterator<Item = &(Key, HotkeyEvent)> {
    self.bindings.iter()
  }
}

/// 按下沿检测；按住不放只触发一次
#[derive(Debug, Default)]
pub struct EdgeDetector {
  watched: Vec<(u8, HotkeyEvent)>,
  previous: [u8; 32],
}

impl EdgeDetector {
  pub fn new(watched: Vec<(u8, HotkeyEvent)>) -> Self {
    Self {
      watched,
      previous: [0; 32],
    }
  }

  fn is_down(keys: &[u8; 32], keycode: u8) -> bool {
    keys[(keycode / 8) as usize] & (1 << (keycode % 8)) != 0
  }

  /// `keys` 为 QueryKeymap 返回的 256 位按键位图
  pub fn update(&mut self, keys: &[u8; 32]) -> Vec<HotkeyEvent> {
    let events = self
      .watched
      .iter()
      .filter(|(kc, _)| Self::is_down(keys, *kc) && !Self::is_down(&self.previous, *kc))
      .map(|(_, event)| *event)
      .collect();
    self.previous = *keys;
    events
  }
}

/// 把热键事件分派给工作线程和叠加窗口
pub struct HotkeyDispatcher {
  flight: SingleFlight,
  requests: Sender<FlightToken>,
  control: Option<PresenterControl>,
  shutdown: Shutdown,
}

impl HotkeyDispatcher {
  pub fn new(
    flight: SingleFlight,
    requests: Sender<FlightToken>,
    control: Option<PresenterControl>,
    shutdown: Shutdown,
  ) -> Self {
    Self {
      flight,
      requests,
      control,
      shutdown,
    }
  }

  pub fn dispatch(&self, event: HotkeyEvent) -> ControlFlow<()> {
    match event {
      HotkeyEvent::Generate => match self.flight.try_acquire() {
        Some(token) => {
          info!("收到生成请求");
          if self.requests.send(token).is_err() {
            warn!("工作线程已退出");
            return ControlFlow::Break(());
          }
        }
        None => info!("上一轮尚未完成，忽略本次触发"),
      },
      HotkeyEvent::ToggleVisibility => match &self.control {
        Some(control) => {
          let visible = control.toggle_visibility();
          info!("叠加窗口{}", if visible { "显示" } else { "隐藏" });
        }
        None => debug!("没有叠加窗口，忽略切换"),
      },
      HotkeyEvent::Quit => {
        info!("收到退出按键");
        self.shutdown.trigger();
        if let Some(control) = &self.control {
          control.request_close();
        }
        return ControlFlow::Break(());
      }
    }
    ControlFlow::Continue(())
  }
}
