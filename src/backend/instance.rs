// Vulkan Instance - connection to the backend
//
// Responsibilities:
// - Load the Vulkan library and create the instance
// - Enable validation (and a log-forwarding debug messenger) when available
// - Enumerate physical devices and wrap each one in a `Device`

use super::error::{Check, Error, Result};
use super::Device;
use ash::{extensions::ext::DebugUtils, vk, Entry};
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

// Everything is forwarded; the log filter decides what is shown
const MESSENGER_SEVERITIES: vk::DebugUtilsMessageSeverityFlagsEXT =
    vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
    );

/// Settings used when creating an [`Instance`]
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub app_name: String,
    pub validation: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            validation: true,
        }
    }
}

struct Live {
    // Order matters for drop: the entry must outlive the instance
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

/// Owning handle to a Vulkan instance.
///
/// `Instance::default()` is the empty state; dropping it is a no-op.
#[derive(Default)]
pub struct Instance {
    live: Option<Live>,
}

impl Instance {
    pub fn new(desc: &InstanceDesc) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", desc.app_name);

        let entry = unsafe { Entry::load() }?;

        let validation = desc.validation && Self::layer_available(&entry, VALIDATION_LAYER)?;
        if desc.validation && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        let debug_utils_available =
            validation && Self::extension_available(&entry, DebugUtils::name())?;

        // Interior NULs cannot come from a sane config; fall back to the crate name
        let app_name = CString::new(desc.app_name.as_str())
            .unwrap_or_else(|_| CString::from(c"vkcompute"));

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkcompute")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };
        let extensions = if debug_utils_available {
            vec![DebugUtils::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extensions);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .check("vkCreateInstance")?;

        let mut live = Live {
            instance,
            debug_utils: None,
            _entry: entry,
        };

        if debug_utils_available {
            // On failure `live` is dropped below and the instance torn down
            let debug_utils = DebugUtils::new(&live._entry, &live.instance);
            let messenger = Self::create_messenger(&debug_utils);
            match messenger {
                Ok(messenger) => live.debug_utils = Some((debug_utils, messenger)),
                Err(err) => {
                    drop(Instance { live: Some(live) });
                    return Err(err);
                }
            }
        }

        log::debug!(
            "Instance ready (validation: {}, debug messenger: {})",
            validation,
            live.debug_utils.is_some()
        );

        Ok(Self { live: Some(live) })
    }

    fn layer_available(entry: &Entry, name: &CStr) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .check("vkEnumerateInstanceLayerProperties")?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name))
    }

    fn extension_available(entry: &Entry, name: &CStr) -> Result<bool> {
        let extensions = entry
            .enumerate_instance_extension_properties(None)
            .check("vkEnumerateInstanceExtensionProperties")?;
        Ok(extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name))
    }

    fn create_messenger(debug_utils: &DebugUtils) -> Result<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(MESSENGER_SEVERITIES)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .check("vkCreateDebugUtilsMessengerEXT")
    }

    /// Whether this instance still owns a live backend connection
    pub fn is_null(&self) -> bool {
        self.live.is_none()
    }

    pub(crate) fn raw(&self) -> Result<&ash::Instance> {
        self.live
            .as_ref()
            .map(|live| &live.instance)
            .ok_or(Error::Released("Instance"))
    }

    /// One entry per physical device, in enumeration order.
    ///
    /// Devices without a compute-capable queue family come back as
    /// `Err(Error::NoComputeQueue)`. The list is a snapshot; call again for a
    /// fresh one.
    pub fn devices(&self) -> Result<Vec<Result<Device<'_>>>> {
        let physical_devices = unsafe { self.raw()?.enumerate_physical_devices() }
            .check("vkEnumeratePhysicalDevices")?;

        log::info!("Found {} physical device(s)", physical_devices.len());

        Ok(physical_devices
            .into_iter()
            .map(|physical_device| Device::new(self, physical_device))
            .collect())
    }

    /// First device that can run compute work
    pub fn first_device(&self) -> Result<Device<'_>> {
        let mut first_err = None;
        for device in self.devices()? {
            match device {
                Ok(device) => return Ok(device),
                Err(err @ Error::NoComputeQueue { .. }) => {
                    log::warn!("{}", err);
                    first_err.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(first_err.unwrap_or(Error::NoDevice))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };

        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = live.debug_utils {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            live.instance.destroy_instance(None);
        }
    }
}

// Forwards validation messages to the log facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::log!(
        log_level(message_severity),
        "[Vulkan] {}",
        message.to_string_lossy()
    );

    vk::FALSE
}

fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}
